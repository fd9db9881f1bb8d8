//! In-process sources
//!
//! Scripted [`ChangeSource`] and [`SnapshotSource`] implementations backed by
//! vectors, for tests and local dry runs of the pipeline.

use crate::common::{
    CdcError, ChangeEvent, ChangeSource, ChangeStream, LogPosition, Result, RowImage,
    ScanCursor, SnapshotChunk, SnapshotSource, StreamItem, TableFilter,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

/// What a subscription does once it has delivered the whole log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndOfLog {
    /// Wait for more events forever, like a live replication stream
    #[default]
    Wait,
    /// End the stream
    Close,
}

/// Replication log held in memory.
#[derive(Debug, Default)]
pub struct MemoryChangeSource {
    log: Mutex<Vec<ChangeEvent>>,
    subscriptions: Mutex<Vec<Option<LogPosition>>>,
    disconnect_after: Mutex<Option<usize>>,
    failed_subscribes: Mutex<u32>,
    end_of_log: EndOfLog,
}

impl MemoryChangeSource {
    /// Create a source over `events`, which must be in log order.
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self {
            log: Mutex::new(events),
            ..Default::default()
        }
    }

    pub fn with_end_of_log(mut self, end_of_log: EndOfLog) -> Self {
        self.end_of_log = end_of_log;
        self
    }

    /// Append events to the log.
    pub async fn append(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        self.log.lock().await.extend(events);
    }

    /// Make the next subscription drop its connection after delivering `n`
    /// items.
    pub async fn disconnect_after(&self, n: usize) {
        *self.disconnect_after.lock().await = Some(n);
    }

    /// Make the next `n` subscribe calls fail with a connection error.
    pub async fn fail_subscribes(&self, n: u32) {
        *self.failed_subscribes.lock().await = n;
    }

    /// Start positions requested by every subscribe call, in order.
    pub async fn subscriptions(&self) -> Vec<Option<LogPosition>> {
        self.subscriptions.lock().await.clone()
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn subscribe(
        &self,
        after: Option<&LogPosition>,
        filter: &TableFilter,
    ) -> Result<ChangeStream> {
        self.subscriptions.lock().await.push(after.cloned());
        {
            let mut failing = self.failed_subscribes.lock().await;
            if *failing > 0 {
                *failing -= 1;
                return Err(CdcError::connection("source unavailable"));
            }
        }

        // Other tables' entries are reported as progress, like a binlog
        // reader skipping foreign rows events
        let mut items: Vec<StreamItem> = self
            .log
            .lock()
            .await
            .iter()
            .filter(|e| after.map_or(true, |a| e.position > *a))
            .map(|e| {
                if filter.matches(e) {
                    StreamItem::Change(e.clone())
                } else {
                    StreamItem::Progress(e.position.clone())
                }
            })
            .collect();

        let disconnect = self.disconnect_after.lock().await.take();
        let tail: ChangeStream = match (disconnect, self.end_of_log) {
            (Some(n), _) if n < items.len() => {
                items.truncate(n);
                stream::once(async { Err(CdcError::ConnectionClosed) }).boxed()
            }
            (_, EndOfLog::Wait) => stream::pending().boxed(),
            (_, EndOfLog::Close) => stream::empty().boxed(),
        };

        Ok(stream::iter(items.into_iter().map(Ok)).chain(tail).boxed())
    }

    async fn current_position(&self) -> Result<LogPosition> {
        self.log
            .lock()
            .await
            .last()
            .map(|e| e.position.clone())
            .ok_or_else(|| CdcError::replication("replication log is empty"))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Table contents held in memory, scanned with offset cursors.
#[derive(Debug)]
pub struct MemorySnapshotSource {
    rows: Vec<RowImage>,
    reference: LogPosition,
    fetches: Mutex<u64>,
}

impl MemorySnapshotSource {
    pub fn new(rows: Vec<RowImage>, reference: LogPosition) -> Self {
        Self {
            rows,
            reference,
            fetches: Mutex::new(0),
        }
    }

    /// Number of chunks fetched so far.
    pub async fn fetches(&self) -> u64 {
        *self.fetches.lock().await
    }
}

#[async_trait]
impl SnapshotSource for MemorySnapshotSource {
    async fn reference_position(&self) -> Result<LogPosition> {
        Ok(self.reference.clone())
    }

    async fn estimate_row_count(&self, _filter: &TableFilter) -> Result<Option<u64>> {
        Ok(Some(self.rows.len() as u64))
    }

    async fn fetch_chunk(
        &self,
        _filter: &TableFilter,
        cursor: Option<&ScanCursor>,
        chunk_size: usize,
    ) -> Result<SnapshotChunk> {
        let start = match cursor {
            None => 0,
            Some(ScanCursor::Offset(n)) => *n as usize,
            Some(other) => {
                return Err(CdcError::invalid_state(format!(
                    "unsupported cursor {other:?} for in-memory scan"
                )))
            }
        };
        *self.fetches.lock().await += 1;

        let end = (start + chunk_size).min(self.rows.len());
        let rows = self.rows.get(start..end).unwrap_or_default().to_vec();
        let next = (end < self.rows.len()).then_some(ScanCursor::Offset(end as u64));
        Ok(SnapshotChunk { rows, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(offset: u64) -> ChangeEvent {
        ChangeEvent::insert(
            "shop",
            "orders",
            RowImage::new().with("id", offset as i64),
            LogPosition::new("mysql-bin.000001", offset),
        )
    }

    #[tokio::test]
    async fn test_subscribe_is_strictly_after() {
        let source = MemoryChangeSource::new(vec![event(10), event(11), event(12)])
            .with_end_of_log(EndOfLog::Close);
        let filter = TableFilter::new("shop", "orders");

        let after = LogPosition::new("mysql-bin.000001", 11);
        let events: Vec<_> = source
            .subscribe(Some(&after), &filter)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().position().offset, 12);
        assert_eq!(source.subscriptions().await, vec![Some(after)]);
    }

    #[tokio::test]
    async fn test_other_tables_are_progress() {
        let mut log = vec![event(10)];
        log.push(ChangeEvent::insert(
            "shop",
            "customers",
            RowImage::new().with("id", 1i64),
            LogPosition::new("mysql-bin.000001", 11),
        ));
        let source = MemoryChangeSource::new(log).with_end_of_log(EndOfLog::Close);
        let filter = TableFilter::new("shop", "orders");

        let items: Vec<_> = source
            .subscribe(None, &filter)
            .await
            .unwrap()
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert!(matches!(&items[0], StreamItem::Change(e) if e.position.offset == 10));
        assert_eq!(items[1], StreamItem::Progress(LogPosition::new("mysql-bin.000001", 11)));
        assert_eq!(
            source.current_position().await.unwrap(),
            LogPosition::new("mysql-bin.000001", 11)
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_one_shot() {
        let source = MemoryChangeSource::new(vec![event(1), event(2), event(3)])
            .with_end_of_log(EndOfLog::Close);
        let filter = TableFilter::new("shop", "orders");
        source.disconnect_after(1).await;

        let first: Vec<_> = source.subscribe(None, &filter).await.unwrap().collect().await;
        assert_eq!(first.len(), 2);
        assert!(first[1].is_err());

        let second: Vec<_> = source.subscribe(None, &filter).await.unwrap().collect().await;
        assert_eq!(second.len(), 3);
        assert!(second.iter().all(|e| e.is_ok()));
    }

    #[tokio::test]
    async fn test_snapshot_chunks() {
        let rows = (0..5).map(|i| RowImage::new().with("id", i as i64)).collect();
        let source = MemorySnapshotSource::new(rows, LogPosition::new("mysql-bin.000001", 50));
        let filter = TableFilter::new("shop", "orders");

        let first = source.fetch_chunk(&filter, None, 2).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        assert_eq!(first.next, Some(ScanCursor::Offset(2)));

        let last = source
            .fetch_chunk(&filter, Some(&ScanCursor::Offset(4)), 2)
            .await
            .unwrap();
        assert_eq!(last.rows.len(), 1);
        assert!(last.next.is_none());
        assert_eq!(source.fetches().await, 2);
    }
}
