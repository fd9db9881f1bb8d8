//! Change event representation
//!
//! One [`ChangeEvent`] per observed row mutation. Inserts carry only the new
//! row image, deletes only the prior one, updates both.

use crate::common::{CdcError, LogPosition, Result, RowImage};
use chrono::{DateTime, Utc};
use std::fmt;

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(CdcError::decode(format!("unknown event type '{other}'"))),
        }
    }
}

/// A row-level change captured from the replication log.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Source schema (MySQL database)
    pub schema: String,
    /// Source table
    pub table: String,
    /// Mutation kind
    pub kind: ChangeKind,
    /// Row before the change (update/delete)
    pub before: Option<RowImage>,
    /// Row after the change (insert/update)
    pub after: Option<RowImage>,
    /// Position of this change in the replication log
    pub position: LogPosition,
    /// Server id of the source that produced the change
    pub server_id: u32,
    /// When the source recorded the change
    pub captured_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create a new INSERT event
    pub fn insert(
        schema: impl Into<String>,
        table: impl Into<String>,
        after: RowImage,
        position: LogPosition,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            kind: ChangeKind::Insert,
            before: None,
            after: Some(after),
            position,
            server_id: 0,
            captured_at: Utc::now(),
        }
    }

    /// Create a new UPDATE event
    pub fn update(
        schema: impl Into<String>,
        table: impl Into<String>,
        before: RowImage,
        after: RowImage,
        position: LogPosition,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            kind: ChangeKind::Update,
            before: Some(before),
            after: Some(after),
            position,
            server_id: 0,
            captured_at: Utc::now(),
        }
    }

    /// Create a new DELETE event
    pub fn delete(
        schema: impl Into<String>,
        table: impl Into<String>,
        before: RowImage,
        position: LogPosition,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            kind: ChangeKind::Delete,
            before: Some(before),
            after: None,
            position,
            server_id: 0,
            captured_at: Utc::now(),
        }
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    /// The image written to the `payload` column: the new row for inserts and
    /// updates, the removed row for deletes.
    pub fn payload(&self) -> Option<&RowImage> {
        match self.kind {
            ChangeKind::Insert | ChangeKind::Update => self.after.as_ref(),
            ChangeKind::Delete => self.before.as_ref(),
        }
    }

    /// Whether this event belongs to `schema.table`.
    pub fn is_for(&self, schema: &str, table: &str) -> bool {
        self.schema == schema && self.table == table
    }

    /// Check that the row images match the event kind.
    pub fn validate(&self) -> Result<()> {
        let ok = match self.kind {
            ChangeKind::Insert => self.after.is_some() && self.before.is_none(),
            ChangeKind::Update => self.after.is_some() && self.before.is_some(),
            ChangeKind::Delete => self.after.is_none() && self.before.is_some(),
        };
        if ok {
            Ok(())
        } else {
            Err(CdcError::decode(format!(
                "{} event for {}.{} at {} has mismatched row images",
                self.kind, self.schema, self.table, self.position
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(offset: u64) -> LogPosition {
        LogPosition::new("mysql-bin.000001", offset)
    }

    #[test]
    fn test_insert_event() {
        let event = ChangeEvent::insert("shop", "orders", RowImage::new().with("id", 1i64), pos(10))
            .with_server_id(7);

        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.server_id, 7);
        assert!(event.before.is_none());
        assert_eq!(event.payload().and_then(|r| r.get("id")), Some(&1i64.into()));
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_delete_payload_is_prior_image() {
        let before = RowImage::new().with("id", 5i64);
        let event = ChangeEvent::delete("shop", "orders", before.clone(), pos(12));

        assert_eq!(event.payload(), Some(&before));
        assert!(event.is_for("shop", "orders"));
        assert!(!event.is_for("shop", "customers"));
    }

    #[test]
    fn test_validate_rejects_mismatched_images() {
        let mut event = ChangeEvent::insert("shop", "orders", RowImage::new(), pos(10));
        event.kind = ChangeKind::Update;
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete] {
            assert_eq!(kind.as_str().parse::<ChangeKind>().unwrap(), kind);
        }
        assert!("truncate".parse::<ChangeKind>().is_err());
    }
}
