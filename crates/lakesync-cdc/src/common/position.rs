//! Replication log positions
//!
//! A [`LogPosition`] names a point in the source's replication log as a
//! `(file, offset)` pair. Positions are totally ordered: first by file name,
//! then by byte offset. MySQL binlog file names carry a zero-padded sequence
//! suffix (`mysql-bin.000042`), so lexical order is log order.
//!
//! Rows packed into one multi-row binlog event share the event's end offset
//! on the wire. Sources assign each row a distinct offset inside the event's
//! byte range instead, so every emitted change has its own position and a
//! watermark can land between two rows of the same event.

use crate::common::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// First readable offset of every binlog file (after the 4-byte magic header).
pub const BINLOG_START_OFFSET: u64 = 4;

/// Position in a replication log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    /// Log file name
    pub file: String,
    /// Byte offset within the file
    pub offset: u64,
}

impl LogPosition {
    /// Create a new position.
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }

    /// Position of the first event in `file`.
    pub fn start_of(file: impl Into<String>) -> Self {
        Self::new(file, BINLOG_START_OFFSET)
    }

    /// Whether this position lies in `file`.
    pub fn is_in(&self, file: &str) -> bool {
        self.file == file
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

impl FromStr for LogPosition {
    type Err = CdcError;

    /// Parse `file:offset`.
    fn from_str(s: &str) -> Result<Self> {
        let (file, offset) = s
            .rsplit_once(':')
            .ok_or_else(|| CdcError::config(format!("invalid log position '{s}'")))?;
        if file.is_empty() {
            return Err(CdcError::config(format!(
                "invalid log position '{s}': empty file name"
            )));
        }
        let offset = offset
            .parse::<u64>()
            .map_err(|e| CdcError::config(format!("invalid log position '{s}': {e}")))?;
        Ok(Self::new(file, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_by_file_then_offset() {
        let a = LogPosition::new("mysql-bin.000001", 900);
        let b = LogPosition::new("mysql-bin.000002", 4);
        let c = LogPosition::new("mysql-bin.000002", 120);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.clone().max(c.clone()), c);
    }

    #[test]
    fn test_display_and_parse() {
        let pos = LogPosition::new("mysql-bin.000003", 1547);
        assert_eq!(pos.to_string(), "mysql-bin.000003:1547");
        assert_eq!("mysql-bin.000003:1547".parse::<LogPosition>().unwrap(), pos);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("mysql-bin.000003".parse::<LogPosition>().is_err());
        assert!(":12".parse::<LogPosition>().is_err());
        assert!("mysql-bin.000003:abc".parse::<LogPosition>().is_err());
    }

    #[test]
    fn test_start_of() {
        let pos = LogPosition::start_of("mysql-bin.000009");
        assert_eq!(pos.offset, BINLOG_START_OFFSET);
        assert!(pos.is_in("mysql-bin.000009"));
    }
}
