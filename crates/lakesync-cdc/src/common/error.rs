//! Pipeline errors
//!
//! One [`CdcError`] enum for every component, with driver variants behind
//! their features. [`CdcError::is_retriable`] decides between backoff and a
//! fatal stop in the coordinator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error class, logged next to the error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Source database rejected a query
    Database,
    /// Replication log errors (binlog stream)
    Replication,
    /// Row decoding errors (unsupported column types, shape mismatch)
    Decode,
    /// Table store errors (append, catalog)
    Storage,
    /// Watermark store errors
    Checkpoint,
    /// Bad settings
    Configuration,
    /// Unreachable peer or timeout
    Network,
    Serialization,
    Other,
}

/// Error raised anywhere in the pipeline.
#[derive(Error, Debug)]
pub enum CdcError {
    /// PostgreSQL error (watermark store)
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL protocol error
    #[cfg(feature = "mysql")]
    #[error("MySQL error: {0}")]
    MySql(String),

    /// Iceberg catalog or table error
    #[cfg(feature = "iceberg")]
    #[error("Iceberg error: {0}")]
    Iceberg(String),

    /// Source or store unreachable
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection closed by the peer
    #[error("Connection closed")]
    ConnectionClosed,

    /// Replication log error
    #[error("Replication error: {0}")]
    Replication(String),

    /// Unsupported or unexpected column shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// Table append rejected
    #[error("Write error: {0}")]
    Write(String),

    /// Watermark read or upsert failed
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload could not be encoded or parsed
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Broken internal invariant
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Stop signal received while an operation was pending
    #[error("Shutdown requested")]
    Shutdown,

    /// Retry budget exhausted
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<CdcError>,
    },

    #[error("{0}")]
    Other(String),
}

impl CdcError {
    #[cfg(feature = "mysql")]
    pub fn mysql(msg: impl Into<String>) -> Self {
        Self::MySql(msg.into())
    }

    #[cfg(feature = "iceberg")]
    pub fn iceberg(msg: impl Into<String>) -> Self {
        Self::Iceberg(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }

    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Wrap the last error of a retried operation.
    pub fn retries_exhausted(operation: impl Into<String>, attempts: u32, last: CdcError) -> Self {
        Self::RetriesExhausted {
            operation: operation.into(),
            attempts,
            source: Box::new(last),
        }
    }

    /// Whether the same operation may succeed if attempted again.
    ///
    /// Decode and configuration errors never are.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::ConnectionClosed => true,
            Self::Timeout(_) => true,
            Self::Write(_) => true,
            Self::Checkpoint(_) => true,

            Self::Replication(msg) => {
                let msg = msg.to_ascii_lowercase();
                ["temporarily", "reset", "lost"].iter().any(|m| msg.contains(m))
            }

            #[cfg(feature = "postgres")]
            Self::Postgres(e) => is_transient_pg_error(e),

            #[cfg(feature = "mysql")]
            Self::MySql(msg) => ["Lost connection", "Deadlock", "Lock wait timeout", "gone away"]
                .iter()
                .any(|m| msg.contains(m)),

            #[cfg(feature = "iceberg")]
            Self::Iceberg(msg) => {
                msg.contains("CommitFailed")
                    || msg.contains("conflict")
                    || msg.contains("Unexpected")
            }

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::Decode(_)
            | Self::Config(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::InvalidState(_)
            | Self::Shutdown
            | Self::RetriesExhausted { .. }
            | Self::Other(_) => false,
        }
    }

    /// Whether this error is a clean stop rather than a failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => ErrorCategory::Checkpoint,
            #[cfg(feature = "mysql")]
            Self::MySql(_) => ErrorCategory::Database,
            #[cfg(feature = "iceberg")]
            Self::Iceberg(_) => ErrorCategory::Storage,
            Self::Connection(_) => ErrorCategory::Network,
            Self::ConnectionClosed => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Network,
            Self::Io(_) => ErrorCategory::Network,
            Self::Replication(_) => ErrorCategory::Replication,
            Self::Decode(_) => ErrorCategory::Decode,
            Self::Write(_) => ErrorCategory::Storage,
            Self::Checkpoint(_) => ErrorCategory::Checkpoint,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::RetriesExhausted { source, .. } => source.category(),
            Self::InvalidState(_) | Self::Shutdown | Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Stable code for log fields.
    pub fn error_code(&self) -> &'static str {
        match self {
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => "postgres_error",
            #[cfg(feature = "mysql")]
            Self::MySql(_) => "mysql_error",
            #[cfg(feature = "iceberg")]
            Self::Iceberg(_) => "iceberg_error",
            Self::Connection(_) => "connection_error",
            Self::ConnectionClosed => "connection_closed",
            Self::Replication(_) => "replication_error",
            Self::Decode(_) => "decode_error",
            Self::Write(_) => "write_error",
            Self::Checkpoint(_) => "checkpoint_error",
            Self::Config(_) => "config_error",
            Self::Serialization(_) => "serialization_error",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
            Self::Timeout(_) => "timeout",
            Self::InvalidState(_) => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Other(_) => "unknown",
        }
    }
}

#[cfg(feature = "mysql")]
impl From<mysql_async::Error> for CdcError {
    fn from(e: mysql_async::Error) -> Self {
        match e {
            mysql_async::Error::Io(io) => Self::Connection(io.to_string()),
            other => Self::MySql(other.to_string()),
        }
    }
}

/// SQLSTATE classes 08 (connection), 40 (rollback), 53 (resources) and 57
/// (operator intervention, except 57014 query_canceled) are transient.
#[cfg(feature = "postgres")]
fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    match e.as_db_error().map(|db| db.code().code()) {
        Some("57014") => false,
        Some(code) => matches!(code.get(..2), Some("08" | "40" | "53" | "57")),
        None => e.is_closed() || e.to_string().to_lowercase().contains("timeout"),
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replication_error_retriable_by_message() {
        assert!(CdcError::replication("binlog connection reset by peer").is_retriable());
        assert!(!CdcError::replication("binlog purged before mysql-bin.000004").is_retriable());
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(CdcError::ConnectionClosed.is_retriable());
        assert!(CdcError::connection("mysql:3306").is_retriable());
        assert!(CdcError::timeout("5s").is_retriable());
        assert!(CdcError::write("append rejected").is_retriable());
        assert!(CdcError::checkpoint("upsert failed").is_retriable());

        assert!(!CdcError::decode("TIME column").is_retriable());
        assert!(!CdcError::config("bad config").is_retriable());
        assert!(!CdcError::Shutdown.is_retriable());
        assert!(!CdcError::other("unknown").is_retriable());
    }

    #[test]
    fn test_retries_exhausted_wraps_source() {
        let err = CdcError::retries_exhausted("append", 5, CdcError::write("disk full"));
        assert!(!err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Storage);
        assert_eq!(err.error_code(), "retries_exhausted");
        assert!(err.to_string().contains("append failed after 5 attempts"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_categories_by_component() {
        let cases = [
            (CdcError::decode("TIME column"), ErrorCategory::Decode),
            (CdcError::write("append"), ErrorCategory::Storage),
            (CdcError::checkpoint("upsert"), ErrorCategory::Checkpoint),
            (CdcError::config("batch size 0"), ErrorCategory::Configuration),
            (CdcError::timeout("binlog read"), ErrorCategory::Network),
        ];
        for (err, category) in cases {
            assert_eq!(err.category(), category, "{err}");
        }
    }

    #[test]
    fn test_error_code() {
        assert_eq!(CdcError::ConnectionClosed.error_code(), "connection_closed");
        assert_eq!(CdcError::decode("x").error_code(), "decode_error");
        assert_eq!(CdcError::Shutdown.error_code(), "shutdown");
        assert!(CdcError::Shutdown.is_shutdown());
    }
}
