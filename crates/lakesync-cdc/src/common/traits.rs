//! Traits for change and snapshot sources
//!
//! Database-agnostic seams between the pipeline and a concrete source.

use crate::common::{ChangeEvent, LogPosition, Result, RowImage, SqlValue};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// One item of a change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// A row change
    Change(ChangeEvent),
    /// The source read up to this position without a change for the table
    /// (other tables, transaction commits, ...)
    Progress(LogPosition),
}

impl StreamItem {
    pub fn position(&self) -> &LogPosition {
        match self {
            StreamItem::Change(event) => &event.position,
            StreamItem::Progress(position) => position,
        }
    }
}

/// Lazy, ordered sequence of stream items from a source.
pub type ChangeStream = BoxStream<'static, Result<StreamItem>>;

/// The one source table a pipeline captures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableFilter {
    pub schema: String,
    pub table: String,
}

impl TableFilter {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub fn matches_table(&self, schema: &str, table: &str) -> bool {
        self.schema == schema && self.table == table
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.is_for(&self.schema, &self.table)
    }
}

impl fmt::Display for TableFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// A replication log that can be tailed from a position.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Open a stream of changes strictly after `after`, or from the beginning
    /// of the available log when `after` is `None`.
    ///
    /// Sources may push `filter` down; the reader filters again regardless.
    /// Log entries that yield no change for the table should still be
    /// reported as [`StreamItem::Progress`] so bounded runs can see the end
    /// of the log. The stream ends or yields an error when the connection
    /// drops.
    async fn subscribe(
        &self,
        after: Option<&LogPosition>,
        filter: &TableFilter,
    ) -> Result<ChangeStream>;

    /// End of the log as currently written.
    async fn current_position(&self) -> Result<LogPosition>;

    /// Human-readable source name for logs.
    fn name(&self) -> &'static str;
}

/// Resume point of a chunked table scan.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanCursor {
    /// Primary key of the last row returned, in key order (keyset pagination)
    AfterKey(Vec<SqlValue>),
    /// Rows already returned (offset pagination)
    Offset(u64),
}

/// One chunk of a table scan.
#[derive(Debug, Clone, Default)]
pub struct SnapshotChunk {
    /// Rows in scan order
    pub rows: Vec<RowImage>,
    /// Cursor for the next chunk, `None` when the scan is complete
    pub next: Option<ScanCursor>,
}

/// Full-table reads for the backfill.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Current replication log position, captured before the scan starts.
    async fn reference_position(&self) -> Result<LogPosition>;

    /// Estimate row count for a table.
    async fn estimate_row_count(&self, filter: &TableFilter) -> Result<Option<u64>>;

    /// Fetch up to `chunk_size` rows after `cursor` (from the start if `None`).
    async fn fetch_chunk(
        &self,
        filter: &TableFilter,
        cursor: Option<&ScanCursor>,
        chunk_size: usize,
    ) -> Result<SnapshotChunk>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LogPosition;

    #[test]
    fn test_table_filter() {
        let filter = TableFilter::new("shop", "orders");
        let pos = LogPosition::new("mysql-bin.000001", 4);

        assert!(filter.matches(&ChangeEvent::insert("shop", "orders", RowImage::new(), pos.clone())));
        assert!(!filter.matches(&ChangeEvent::insert("shop", "customers", RowImage::new(), pos.clone())));
        assert!(!filter.matches(&ChangeEvent::insert("crm", "orders", RowImage::new(), pos)));
        assert_eq!(filter.to_string(), "shop.orders");
    }
}
