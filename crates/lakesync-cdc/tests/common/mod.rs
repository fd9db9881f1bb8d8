//! Shared helpers for pipeline integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use lakesync_cdc::common::{
    CdcError, ChangeEvent, LogPosition, MemoryTableWriter, Result, RetryConfig, RowImage,
    Watermark, WatermarkKey, WatermarkStore,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const FILE: &str = "mysql-bin.000001";

pub fn key() -> WatermarkKey {
    WatermarkKey::new("orders-sync", 1, "shop", "orders")
}

pub fn pos(offset: u64) -> LogPosition {
    LogPosition::new(FILE, offset)
}

pub fn insert(offset: u64) -> ChangeEvent {
    ChangeEvent::insert(
        "shop",
        "orders",
        RowImage::new().with("id", offset as i64),
        pos(offset),
    )
    .with_server_id(1)
}

pub fn insert_into(table: &str, offset: u64) -> ChangeEvent {
    ChangeEvent::insert(
        "shop",
        table,
        RowImage::new().with("id", offset as i64),
        pos(offset),
    )
    .with_server_id(1)
}

/// Retry budget with millisecond delays.
pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig::builder()
        .max_retries(max_retries)
        .retry_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .jitter(0.0)
        .build()
}

pub fn offsets(events: &[ChangeEvent]) -> Vec<u64> {
    events.iter().map(|e| e.position.offset).collect()
}

/// Poll until `check` holds, giving up after roughly two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// What a [`FaultyWatermarkStore`] does on a scheduled failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Retriable checkpoint error
    Transient,
    /// Non-retriable error, standing in for a process crash
    Crash,
}

/// Watermark store wrapper that fails chosen upserts and checks each
/// upserted position against what the writer already holds.
pub struct FaultyWatermarkStore {
    inner: Arc<dyn WatermarkStore>,
    writer: Option<Arc<MemoryTableWriter>>,
    upserts: AtomicU32,
    faults: Mutex<Vec<(u32, Fault)>>,
    ahead_of_table: AtomicU32,
}

impl FaultyWatermarkStore {
    pub fn new(inner: Arc<dyn WatermarkStore>) -> Self {
        Self {
            inner,
            writer: None,
            upserts: AtomicU32::new(0),
            faults: Mutex::new(Vec::new()),
            ahead_of_table: AtomicU32::new(0),
        }
    }

    /// Verify on every upsert that the table already contains the position.
    pub fn observing(mut self, writer: Arc<MemoryTableWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Fail the upsert call with 1-based number `call`.
    pub async fn fail_upsert(&self, call: u32, fault: Fault) {
        self.faults.lock().await.push((call, fault));
    }

    pub fn upsert_calls(&self) -> u32 {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Upserts whose position was not yet in the table.
    pub fn upserts_ahead_of_table(&self) -> u32 {
        self.ahead_of_table.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WatermarkStore for FaultyWatermarkStore {
    async fn read(&self, key: &WatermarkKey) -> Result<Option<Watermark>> {
        self.inner.read(key).await
    }

    async fn upsert(&self, watermark: &Watermark) -> Result<()> {
        let call = self.upserts.fetch_add(1, Ordering::SeqCst) + 1;
        let fault = self
            .faults
            .lock()
            .await
            .iter()
            .find(|(n, _)| *n == call)
            .map(|(_, f)| *f);
        match fault {
            Some(Fault::Transient) => return Err(CdcError::checkpoint("store briefly unavailable")),
            Some(Fault::Crash) => return Err(CdcError::other("process crashed")),
            None => {}
        }

        if let Some(writer) = &self.writer {
            let in_table = writer
                .rows()
                .await
                .iter()
                .any(|e| e.position == watermark.position);
            if !in_table {
                self.ahead_of_table.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.inner.upsert(watermark).await
    }

    fn name(&self) -> &'static str {
        "faulty"
    }
}
