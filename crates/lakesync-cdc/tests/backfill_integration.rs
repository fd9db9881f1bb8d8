//! Backfill Integration Tests
//!
//! Full-table load followed by the handoff to streaming:
//! - Completion watermark at the snapshot reference position
//! - Streaming resumes strictly after the reference position
//! - Restarted backfills never run twice
//!
//! Run with: cargo test -p lakesync-cdc --test backfill_integration

mod common;

use common::*;
use lakesync_cdc::common::{
    BatchConfig, ChangeKind, MemoryChangeSource, MemorySnapshotSource, MemoryTableWriter,
    MemoryWatermarkStore, Pipeline, PipelineConfig, PipelineMode, PipelineOutcome, PipelineState,
    RowImage, WatermarkStore,
};
use std::sync::Arc;
use tokio::sync::broadcast;

fn table_rows(n: i64) -> Vec<RowImage> {
    (1..=n)
        .map(|id| RowImage::new().with("id", id).with("status", "shipped"))
        .collect()
}

#[tokio::test]
async fn test_backfill_then_stream_from_reference_position() {
    let writer = Arc::new(MemoryTableWriter::new());
    let store = Arc::new(MemoryWatermarkStore::new());
    let snapshot = Arc::new(MemorySnapshotSource::new(table_rows(10_000), pos(50)));

    let config = PipelineConfig::new(key(), PipelineMode::Backfill)
        .with_batch(BatchConfig::builder().max_events(1_000).build())
        .with_retry(fast_retry(3))
        .with_snapshot_chunk_size(2_500);
    let backfill = Pipeline::builder(config)
        .snapshot_source(snapshot.clone())
        .writer(writer.clone())
        .watermark_store(store.clone())
        .build()
        .unwrap();
    let (_tx, rx) = broadcast::channel(1);
    let outcome = backfill.run(rx).await.unwrap();

    let report = match outcome {
        PipelineOutcome::Backfilled(report) => report,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(report.rows, 10_000);
    assert_eq!(report.batches, 10);
    assert_eq!(report.reference_position, pos(50));
    assert_eq!(snapshot.fetches().await, 4);
    assert_eq!(backfill.state(), PipelineState::BackfillDone);

    let watermark = store.read(&key()).await.unwrap().unwrap();
    assert_eq!(watermark.position, pos(50));
    assert!(watermark.backfill_complete);

    let loaded = writer.rows().await;
    assert_eq!(loaded.len(), 10_000);
    assert!(loaded.iter().all(|e| e.kind == ChangeKind::Insert && e.position == pos(50)));

    // Changes at or before the reference position are already in the load
    let source = Arc::new(MemoryChangeSource::new(vec![insert(40), insert(50), insert(60), insert(70)]));
    let streaming = Pipeline::builder(
        PipelineConfig::new(key(), PipelineMode::Cdc)
            .with_batch(BatchConfig::builder().max_events(10).build())
            .with_retry(fast_retry(3))
            .with_until_caught_up(true),
    )
    .change_source(source.clone())
    .writer(writer.clone())
    .watermark_store(store.clone())
    .build()
    .unwrap();
    let (_tx, rx) = broadcast::channel(1);
    streaming.run(rx).await.unwrap();

    assert_eq!(source.subscriptions().await, vec![Some(pos(50))]);
    let appends = writer.appends().await;
    assert_eq!(offsets(appends.last().unwrap()), vec![60, 70]);

    let watermark = store.read(&key()).await.unwrap().unwrap();
    assert_eq!(watermark.position, pos(70));
    assert!(watermark.backfill_complete);
}

#[tokio::test]
async fn test_backfill_runs_once() {
    let writer = Arc::new(MemoryTableWriter::new());
    let store = Arc::new(MemoryWatermarkStore::new());
    let snapshot = Arc::new(MemorySnapshotSource::new(table_rows(30), pos(120)));
    let config = PipelineConfig::new(key(), PipelineMode::Backfill)
        .with_batch(BatchConfig::builder().max_events(10).build())
        .with_retry(fast_retry(3));

    for _ in 0..2 {
        let pipeline = Pipeline::builder(config.clone())
            .snapshot_source(snapshot.clone())
            .writer(writer.clone())
            .watermark_store(store.clone())
            .build()
            .unwrap();
        let (_tx, rx) = broadcast::channel(1);
        pipeline.run(rx).await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::BackfillDone);
    }

    assert_eq!(writer.rows().await.len(), 30);
    assert_eq!(snapshot.fetches().await, 1);
}

#[tokio::test]
async fn test_failed_backfill_leaves_no_completion_mark() {
    let writer = Arc::new(MemoryTableWriter::new());
    writer.fail_next(100);
    let store = Arc::new(MemoryWatermarkStore::new());
    let snapshot = Arc::new(MemorySnapshotSource::new(table_rows(5), pos(120)));

    let pipeline = Pipeline::builder(
        PipelineConfig::new(key(), PipelineMode::Backfill).with_retry(fast_retry(2)),
    )
    .snapshot_source(snapshot)
    .writer(writer.clone())
    .watermark_store(store.clone())
    .build()
    .unwrap();
    let (_tx, rx) = broadcast::channel(1);

    assert!(pipeline.run(rx).await.is_err());
    assert_eq!(pipeline.state(), PipelineState::Fatal);
    assert!(store.read(&key()).await.unwrap().is_none());
}
