//! # Backfill
//!
//! Loads the full current contents of the source table into the target
//! table, then records where streaming must resume.
//!
//! The replication position is captured *before* the scan starts. Every row
//! is written as a synthetic insert stamped with that reference position, and
//! only after the last batch is durable is the watermark upserted with
//! `backfill_complete = true`. Changes that land during the scan are
//! replayed by streaming afterwards, so no change is lost; rows touched
//! during the scan may appear twice in the target.

use crate::common::{
    retry, BatchAccumulator, BatchConfig, CdcError, ChangeEvent, LogPosition, Result,
    RetryConfig, ScanCursor, SharedTableWriter, SharedWatermarkStore, Shutdown,
    SnapshotSource, TableFilter, Watermark, WatermarkKey,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default rows fetched per scan query.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Outcome of a completed backfill.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillReport {
    /// Rows written to the target
    pub rows: u64,
    /// Batches appended
    pub batches: u64,
    /// Position recorded in the completion watermark
    pub reference_position: LogPosition,
    /// Wall time of the run
    pub elapsed: Duration,
}

/// One-shot full table load.
pub struct BackfillLoader {
    key: WatermarkKey,
    snapshot: Arc<dyn SnapshotSource>,
    writer: SharedTableWriter,
    watermarks: SharedWatermarkStore,
    batch: BatchConfig,
    retry: RetryConfig,
    chunk_size: usize,
}

impl BackfillLoader {
    pub fn new(
        key: WatermarkKey,
        snapshot: Arc<dyn SnapshotSource>,
        writer: SharedTableWriter,
        watermarks: SharedWatermarkStore,
    ) -> Self {
        Self {
            key,
            snapshot,
            writer,
            watermarks,
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_batch_config(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Run the backfill to completion.
    ///
    /// Returns [`CdcError::Shutdown`] if stopped before the completion
    /// watermark was written; the next run starts over.
    pub async fn run(&self, shutdown: &mut Shutdown) -> Result<BackfillReport> {
        let started = Instant::now();
        let filter = TableFilter::new(&self.key.schema, &self.key.table);
        let retry_config = &self.retry;

        let writer = &self.writer;
        retry(retry_config, "ensure table", shutdown, || writer.ensure_table()).await?;

        let snapshot = &self.snapshot;
        let reference =
            retry(retry_config, "read reference position", shutdown, || snapshot.reference_position())
                .await?;

        let estimate = match snapshot.estimate_row_count(&filter).await {
            Ok(n) => n,
            Err(e) => {
                warn!(table = %filter, error = %e, "Could not estimate row count");
                None
            }
        };
        info!(
            table = %filter,
            reference = %reference,
            estimated_rows = ?estimate,
            "Starting backfill"
        );

        let mut acc = BatchAccumulator::new(self.batch.clone());
        let mut cursor: Option<ScanCursor> = None;
        let mut rows = 0u64;

        loop {
            if shutdown.poll() {
                info!(table = %filter, rows, "Backfill interrupted");
                return Err(CdcError::Shutdown);
            }

            let filter_ref = &filter;
            let cursor_ref = cursor.as_ref();
            let chunk_size = self.chunk_size;
            let chunk = retry(retry_config, "fetch snapshot chunk", shutdown, || {
                snapshot.fetch_chunk(filter_ref, cursor_ref, chunk_size)
            })
            .await?;

            for row in chunk.rows {
                let event = ChangeEvent::insert(&self.key.schema, &self.key.table, row, reference.clone())
                    .with_server_id(self.key.server_id);
                rows += 1;
                if let Some(batch) = acc.push(event) {
                    let version =
                        retry(retry_config, "append", shutdown, || writer.append(&batch)).await?;
                    debug!(batch = batch.sequence, events = batch.len(), version, "Wrote backfill batch");
                }
            }

            match estimate {
                Some(total) if total > 0 => {
                    let pct = (rows as f64 / total as f64 * 100.0).min(100.0);
                    info!(table = %filter, rows, progress = format!("{pct:.1}%"), "Backfill progress");
                }
                _ => info!(table = %filter, rows, "Backfill progress"),
            }

            match chunk.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if let Some(batch) = acc.flush() {
            let version = retry(retry_config, "append", shutdown, || writer.append(&batch)).await?;
            debug!(batch = batch.sequence, events = batch.len(), version, "Wrote backfill batch");
        }

        let watermark = Watermark::new(self.key.clone(), reference.clone(), true);
        let watermarks = &self.watermarks;
        retry(retry_config, "watermark upsert", shutdown, || watermarks.upsert(&watermark)).await?;

        let report = BackfillReport {
            rows,
            batches: acc.emitted(),
            reference_position: reference,
            elapsed: started.elapsed(),
        };
        info!(
            table = %filter,
            rows = report.rows,
            batches = report.batches,
            reference = %report.reference_position,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Backfill complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::memory::MemorySnapshotSource;
    use crate::common::{MemoryTableWriter, MemoryWatermarkStore, RowImage, WatermarkStore};
    use tokio::sync::broadcast;

    fn key() -> WatermarkKey {
        WatermarkKey::new("conn", 1, "shop", "orders")
    }

    fn rows(n: i64) -> Vec<RowImage> {
        (0..n).map(|i| RowImage::new().with("id", i)).collect()
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::builder()
            .max_retries(3)
            .retry_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2))
            .jitter(0.0)
            .build()
    }

    #[tokio::test]
    async fn test_backfill_writes_rows_then_watermark() {
        let reference = LogPosition::new("mysql-bin.000003", 50);
        let snapshot = Arc::new(MemorySnapshotSource::new(rows(25), reference.clone()));
        let writer = Arc::new(MemoryTableWriter::new());
        let store = Arc::new(MemoryWatermarkStore::new());
        let (_tx, rx) = broadcast::channel(1);

        let loader = BackfillLoader::new(key(), snapshot.clone(), writer.clone(), store.clone())
            .with_batch_config(BatchConfig::builder().max_events(10).build())
            .with_chunk_size(7);
        let report = loader.run(&mut Shutdown::new(rx)).await.unwrap();

        assert_eq!(report.rows, 25);
        assert_eq!(report.batches, 3);
        assert_eq!(report.reference_position, reference);
        assert_eq!(snapshot.fetches().await, 4);

        let written = writer.rows().await;
        assert_eq!(written.len(), 25);
        assert!(written.iter().all(|e| e.position == reference && e.server_id == 1));

        let wm = store.read(&key()).await.unwrap().unwrap();
        assert_eq!(wm.position, reference);
        assert!(wm.backfill_complete);
    }

    #[tokio::test]
    async fn test_backfill_retries_failed_append() {
        let snapshot = Arc::new(MemorySnapshotSource::new(rows(5), LogPosition::new("b.000001", 4)));
        let writer = Arc::new(MemoryTableWriter::new());
        writer.fail_next(2);
        let store = Arc::new(MemoryWatermarkStore::new());
        let (_tx, rx) = broadcast::channel(1);

        let report = BackfillLoader::new(key(), snapshot, writer.clone(), store)
            .with_retry_config(fast_retry())
            .run(&mut Shutdown::new(rx))
            .await
            .unwrap();

        assert_eq!(report.rows, 5);
        assert_eq!(writer.failed_appends(), 2);
        assert_eq!(writer.appends().await.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_no_completion_watermark() {
        let snapshot = Arc::new(MemorySnapshotSource::new(rows(5), LogPosition::new("b.000001", 4)));
        let writer = Arc::new(MemoryTableWriter::new());
        let store = Arc::new(MemoryWatermarkStore::new());
        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();

        let err = BackfillLoader::new(key(), snapshot, writer.clone(), store.clone())
            .run(&mut Shutdown::new(rx))
            .await
            .unwrap_err();

        assert!(err.is_shutdown());
        assert!(writer.rows().await.is_empty());
        assert!(store.read(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_table_still_completes() {
        let reference = LogPosition::new("b.000001", 120);
        let snapshot = Arc::new(MemorySnapshotSource::new(vec![], reference.clone()));
        let writer = Arc::new(MemoryTableWriter::new());
        let store = Arc::new(MemoryWatermarkStore::new());
        let (_tx, rx) = broadcast::channel(1);

        let report = BackfillLoader::new(key(), snapshot, writer.clone(), store.clone())
            .run(&mut Shutdown::new(rx))
            .await
            .unwrap();

        assert_eq!(report.rows, 0);
        assert_eq!(report.batches, 0);
        assert!(writer.appends().await.is_empty());
        assert_eq!(store.read(&key()).await.unwrap().unwrap().position, reference);
    }
}
