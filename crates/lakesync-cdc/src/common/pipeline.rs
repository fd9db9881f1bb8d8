//! # Pipeline coordinator
//!
//! Drives one watermark key end to end. In backfill mode it runs the
//! [`BackfillLoader`] once; in cdc mode it runs the commit loop:
//!
//! ```text
//! reader ──▶ accumulator ──▶ TableWriter::append ──▶ WatermarkStore::upsert
//! ```
//!
//! The append of batch *k* always completes before its watermark is upserted,
//! and batch *k + 1* is not written before the watermark of batch *k*. A crash
//! between the two steps replays at most one batch on restart.
//!
//! ## States
//!
//! ```text
//! Init ──▶ BackfillRunning ──▶ BackfillDone
//!   │
//!   └────▶ Streaming ◀──▶ Retrying ──▶ Fatal
//!              │
//!              └──▶ Stopped
//! ```

use crate::common::{
    retry, BackfillLoader, BackfillReport, Batch, BatchAccumulator, BatchConfig, CdcError,
    ChangeSource, ChangeStreamReader, LogPosition, Result, RetryConfig, SharedTableWriter,
    SharedWatermarkStore, Shutdown, SnapshotSource, StreamItem, TableFilter, Watermark,
    WatermarkKey,
};
use crate::common::backfill::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// What a pipeline run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Stream changes from the stored watermark
    #[default]
    Cdc,
    /// Load the full table once, then exit
    Backfill,
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMode::Cdc => write!(f, "cdc"),
            PipelineMode::Backfill => write!(f, "backfill"),
        }
    }
}

impl FromStr for PipelineMode {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cdc" | "streaming" => Ok(PipelineMode::Cdc),
            "backfill" => Ok(PipelineMode::Backfill),
            other => Err(CdcError::config(format!(
                "unknown mode '{other}', expected 'cdc' or 'backfill'"
            ))),
        }
    }
}

/// Where a cdc run without a stored watermark starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialPosition {
    /// Beginning of the available log
    #[default]
    Earliest,
    /// Source's current position; the watermark is seeded there
    Latest,
}

impl FromStr for InitialPosition {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(InitialPosition::Earliest),
            "latest" => Ok(InitialPosition::Latest),
            other => Err(CdcError::config(format!(
                "unknown initial position '{other}', expected 'earliest' or 'latest'"
            ))),
        }
    }
}

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    BackfillRunning,
    BackfillDone,
    Streaming,
    Retrying,
    Fatal,
    Stopped,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::BackfillDone | PipelineState::Fatal | PipelineState::Stopped
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Init => "init",
            PipelineState::BackfillRunning => "backfill_running",
            PipelineState::BackfillDone => "backfill_done",
            PipelineState::Streaming => "streaming",
            PipelineState::Retrying => "retrying",
            PipelineState::Fatal => "fatal",
            PipelineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub key: WatermarkKey,
    pub mode: PipelineMode,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub initial_position: InitialPosition,
    /// Stop once everything up to the source's position at startup is committed
    pub until_caught_up: bool,
    /// Commit the pending buffer when stopped
    pub drain_on_shutdown: bool,
    /// Rows per backfill scan query
    pub snapshot_chunk_size: usize,
}

impl PipelineConfig {
    pub fn new(key: WatermarkKey, mode: PipelineMode) -> Self {
        Self {
            key,
            mode,
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            initial_position: InitialPosition::default(),
            until_caught_up: false,
            drain_on_shutdown: true,
            snapshot_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_initial_position(mut self, initial_position: InitialPosition) -> Self {
        self.initial_position = initial_position;
        self
    }

    pub fn with_until_caught_up(mut self, enabled: bool) -> Self {
        self.until_caught_up = enabled;
        self
    }

    pub fn with_drain_on_shutdown(mut self, enabled: bool) -> Self {
        self.drain_on_shutdown = enabled;
        self
    }

    pub fn with_snapshot_chunk_size(mut self, rows: usize) -> Self {
        self.snapshot_chunk_size = rows;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.key.validate()?;
        self.batch.validate()?;
        if self.snapshot_chunk_size == 0 {
            return Err(CdcError::config("snapshot chunk size must be greater than 0"));
        }
        Ok(())
    }
}

/// Pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Events read from the change stream
    pub events_read: AtomicU64,
    /// Events durably committed
    pub events_committed: AtomicU64,
    /// Batches committed
    pub batches_committed: AtomicU64,
    /// Uncommitted events dropped on reconnect
    pub events_discarded: AtomicU64,
    /// Retried operations (appends, upserts, reconnects)
    pub retries: AtomicU64,
    /// Successful reconnects
    pub reconnects: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self) {
        self.events_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self, events: usize) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
        self.events_committed.fetch_add(events as u64, Ordering::Relaxed);
    }

    pub fn record_discarded(&self, events: usize) {
        self.events_discarded.fetch_add(events as u64, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            events_read: self.events_read.load(Ordering::Relaxed),
            events_committed: self.events_committed.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of pipeline statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub events_read: u64,
    pub events_committed: u64,
    pub batches_committed: u64,
    pub events_discarded: u64,
    pub retries: u64,
    pub reconnects: u64,
}

/// How a run ended, other than by a fatal error.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Backfill ran to completion
    Backfilled(BackfillReport),
    /// Backfill mode found a completed backfill and did nothing
    AlreadyBackfilled(Watermark),
    /// Stopped by signal; carries the last watermark this run committed
    Stopped { watermark: Option<Watermark> },
    /// Committed everything up to the startup position of the source
    CaughtUp { watermark: Option<Watermark> },
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    source: Option<Arc<dyn ChangeSource>>,
    snapshot: Option<Arc<dyn SnapshotSource>>,
    writer: Option<SharedTableWriter>,
    watermarks: Option<SharedWatermarkStore>,
}

impl PipelineBuilder {
    pub fn change_source(mut self, source: Arc<dyn ChangeSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn snapshot_source(mut self, snapshot: Arc<dyn SnapshotSource>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn writer(mut self, writer: SharedTableWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn watermark_store(mut self, store: SharedWatermarkStore) -> Self {
        self.watermarks = Some(store);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let writer = self
            .writer
            .ok_or_else(|| CdcError::config("pipeline requires a table writer"))?;
        let watermarks = self
            .watermarks
            .ok_or_else(|| CdcError::config("pipeline requires a watermark store"))?;
        match self.config.mode {
            PipelineMode::Cdc if self.source.is_none() => {
                return Err(CdcError::config("cdc mode requires a change source"))
            }
            PipelineMode::Backfill if self.snapshot.is_none() => {
                return Err(CdcError::config("backfill mode requires a snapshot source"))
            }
            _ => {}
        }

        let (state, _) = watch::channel(PipelineState::Init);
        Ok(Pipeline {
            config: self.config,
            source: self.source,
            snapshot: self.snapshot,
            writer,
            watermarks,
            state,
            stats: Arc::new(PipelineStats::new()),
        })
    }
}

enum Step {
    Stop,
    Flush,
    Read(Result<Option<StreamItem>>),
}

/// Coordinator for one watermark key.
pub struct Pipeline {
    config: PipelineConfig,
    source: Option<Arc<dyn ChangeSource>>,
    snapshot: Option<Arc<dyn SnapshotSource>>,
    writer: SharedTableWriter,
    watermarks: SharedWatermarkStore,
    state: watch::Sender<PipelineState>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            source: None,
            snapshot: None,
            writer: None,
            watermarks: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Run until done, stopped, or failed.
    ///
    /// Any error returned leaves the pipeline in [`PipelineState::Fatal`].
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<PipelineOutcome> {
        let mut shutdown = Shutdown::new(shutdown);
        self.set_state(PipelineState::Init);
        info!(key = %self.config.key, mode = %self.config.mode, "Starting pipeline");

        let result = match self.config.mode {
            PipelineMode::Backfill => self.run_backfill(&mut shutdown).await,
            PipelineMode::Cdc => self.run_streaming(&mut shutdown).await,
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_shutdown() => {
                self.set_state(PipelineState::Stopped);
                info!(key = %self.config.key, "Pipeline stopped");
                Ok(PipelineOutcome::Stopped { watermark: None })
            }
            Err(e) => {
                self.set_state(PipelineState::Fatal);
                error!(
                    key = %self.config.key,
                    error = %e,
                    code = e.error_code(),
                    "Pipeline failed"
                );
                Err(e)
            }
        }
    }

    async fn read_watermark(&self, shutdown: &mut Shutdown) -> Result<Option<Watermark>> {
        let store = &self.watermarks;
        let key = &self.config.key;
        retry(&self.config.retry, "watermark read", shutdown, || store.read(key)).await
    }

    async fn run_backfill(&self, shutdown: &mut Shutdown) -> Result<PipelineOutcome> {
        let snapshot = self
            .snapshot
            .clone()
            .ok_or_else(|| CdcError::config("backfill mode requires a snapshot source"))?;

        if let Some(existing) = self.read_watermark(shutdown).await? {
            if existing.backfill_complete {
                info!(watermark = %existing, "Backfill already complete");
                self.set_state(PipelineState::BackfillDone);
                return Ok(PipelineOutcome::AlreadyBackfilled(existing));
            }
            warn!(watermark = %existing, "Watermark exists without completed backfill, loading table");
        }

        self.set_state(PipelineState::BackfillRunning);
        let report = BackfillLoader::new(
            self.config.key.clone(),
            snapshot,
            Arc::clone(&self.writer),
            Arc::clone(&self.watermarks),
        )
        .with_batch_config(self.config.batch.clone())
        .with_retry_config(self.config.retry.clone())
        .with_chunk_size(self.config.snapshot_chunk_size)
        .run(shutdown)
        .await?;

        self.stats
            .events_committed
            .fetch_add(report.rows, Ordering::Relaxed);
        self.stats
            .batches_committed
            .fetch_add(report.batches, Ordering::Relaxed);
        self.set_state(PipelineState::BackfillDone);
        Ok(PipelineOutcome::Backfilled(report))
    }

    async fn run_streaming(&self, shutdown: &mut Shutdown) -> Result<PipelineOutcome> {
        let source = self
            .source
            .clone()
            .ok_or_else(|| CdcError::config("cdc mode requires a change source"))?;
        let retry_config = &self.config.retry;

        let writer = &self.writer;
        retry(retry_config, "ensure table", shutdown, || writer.ensure_table()).await?;

        let mut committed = self.read_watermark(shutdown).await?;
        if committed.is_none() && self.config.initial_position == InitialPosition::Latest {
            let position =
                retry(retry_config, "read current position", shutdown, || source.current_position())
                    .await?;
            let seeded = Watermark::new(self.config.key.clone(), position, false);
            let store = &self.watermarks;
            retry(retry_config, "watermark upsert", shutdown, || store.upsert(&seeded)).await?;
            info!(watermark = %seeded, "Seeded watermark at current position");
            committed = Some(seeded);
        }

        let target = if self.config.until_caught_up {
            let position =
                retry(retry_config, "read current position", shutdown, || source.current_position())
                    .await?;
            info!(target = %position, "Catching up to current position");
            Some(position)
        } else {
            None
        };
        if let (Some(target), Some(c)) = (&target, &committed) {
            if c.position >= *target {
                info!(watermark = %c, "Already caught up");
                self.set_state(PipelineState::Stopped);
                return Ok(PipelineOutcome::CaughtUp { watermark: committed });
            }
        }

        let filter = TableFilter::new(&self.config.key.schema, &self.config.key.table);
        let mut reader = ChangeStreamReader::new(source, filter);
        let mut reader_failures = 0u32;

        let resume = committed.as_ref().map(|w| w.position.clone());
        match reader.open(resume).await {
            Ok(()) => {}
            Err(e) if e.is_retriable() => {
                if let Err(e) = self
                    .recover(&mut reader, committed.as_ref(), e, shutdown, &mut reader_failures)
                    .await
                {
                    return self.stop_or_fail(e, committed);
                }
            }
            Err(e) => return Err(e),
        }
        self.set_state(PipelineState::Streaming);

        let mut acc = BatchAccumulator::new(self.config.batch.clone());
        loop {
            let deadline = acc.deadline();
            let step = tokio::select! {
                biased;
                _ = shutdown.recv() => Step::Stop,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Step::Flush,
                read = reader.next_event() => Step::Read(read),
            };

            match step {
                Step::Stop => {
                    reader.close();
                    return self.finish_on_stop(&mut acc, committed, shutdown).await;
                }
                Step::Flush => {
                    if let Some(batch) = acc.flush() {
                        if let Err(e) = self.commit(batch, &mut committed, shutdown).await {
                            return self.stop_or_fail(e, committed);
                        }
                    }
                }
                Step::Read(Ok(Some(StreamItem::Change(event)))) => {
                    reader_failures = 0;
                    self.stats.record_read();
                    let reached = target.as_ref().is_some_and(|t| event.position >= *t);

                    if let Some(batch) = acc.push(event) {
                        if let Err(e) = self.commit(batch, &mut committed, shutdown).await {
                            return self.stop_or_fail(e, committed);
                        }
                    }
                    if reached {
                        reader.close();
                        return self.finish_caught_up(&mut acc, committed, shutdown).await;
                    }
                }
                Step::Read(Ok(Some(StreamItem::Progress(position)))) => {
                    reader_failures = 0;
                    if target.as_ref().is_some_and(|t| position >= *t) {
                        reader.close();
                        return self.finish_caught_up(&mut acc, committed, shutdown).await;
                    }
                }
                Step::Read(Ok(None)) => {
                    let cause = CdcError::ConnectionClosed;
                    if let Err(e) = self
                        .reset_reader(&mut reader, &mut acc, committed.as_ref(), cause, shutdown, &mut reader_failures)
                        .await
                    {
                        return self.stop_or_fail(e, committed);
                    }
                }
                Step::Read(Err(e)) if e.is_retriable() => {
                    if let Err(e) = self
                        .reset_reader(&mut reader, &mut acc, committed.as_ref(), e, shutdown, &mut reader_failures)
                        .await
                    {
                        return self.stop_or_fail(e, committed);
                    }
                }
                Step::Read(Err(e)) => return Err(e),
            }
        }
    }

    /// Append then checkpoint one batch.
    async fn commit(
        &self,
        batch: Batch,
        committed: &mut Option<Watermark>,
        shutdown: &mut Shutdown,
    ) -> Result<()> {
        let last = batch
            .last_position()
            .cloned()
            .ok_or_else(|| CdcError::invalid_state("cannot commit an empty batch"))?;
        if let Some(current) = committed.as_ref() {
            if last < current.position {
                return Err(CdcError::invalid_state(format!(
                    "batch ends at {last}, behind committed watermark {}",
                    current.position
                )));
            }
        }

        let writer = &self.writer;
        let batch_ref = &batch;
        let mut attempts = 0u32;
        let version = retry(&self.config.retry, "append", shutdown, || {
            attempts += 1;
            if attempts > 1 {
                self.stats.record_retry();
                self.set_state(PipelineState::Retrying);
            }
            writer.append(batch_ref)
        })
        .await?;

        let next = match committed.as_ref() {
            Some(current) => current.advance_to(last),
            None => Watermark::new(self.config.key.clone(), last, false),
        };
        let store = &self.watermarks;
        let next_ref = &next;
        let mut attempts = 0u32;
        retry(&self.config.retry, "watermark upsert", shutdown, || {
            attempts += 1;
            if attempts > 1 {
                self.stats.record_retry();
                self.set_state(PipelineState::Retrying);
            }
            store.upsert(next_ref)
        })
        .await?;

        self.set_state(PipelineState::Streaming);
        self.stats.record_commit(batch.len());
        let counts = batch.counts();
        info!(
            batch = batch.sequence,
            events = batch.len(),
            inserts = counts.inserts,
            updates = counts.updates,
            deletes = counts.deletes,
            from = %batch.first_position().map(ToString::to_string).unwrap_or_default(),
            position = %next.position,
            wait_ms = batch.wait_time().as_millis() as u64,
            version,
            "Committed batch"
        );
        *committed = Some(next);
        Ok(())
    }

    /// Drop the uncommitted buffer and resume from the committed watermark.
    async fn reset_reader(
        &self,
        reader: &mut ChangeStreamReader,
        acc: &mut BatchAccumulator,
        committed: Option<&Watermark>,
        cause: CdcError,
        shutdown: &mut Shutdown,
        failures: &mut u32,
    ) -> Result<()> {
        let discarded = acc.discard();
        if discarded > 0 {
            self.stats.record_discarded(discarded);
            debug!(discarded, "Discarded uncommitted events");
        }
        self.recover(reader, committed, cause, shutdown, failures).await
    }

    async fn recover(
        &self,
        reader: &mut ChangeStreamReader,
        committed: Option<&Watermark>,
        cause: CdcError,
        shutdown: &mut Shutdown,
        failures: &mut u32,
    ) -> Result<()> {
        self.set_state(PipelineState::Retrying);
        reader.close();
        let resume = committed.map(|w| w.position.clone());
        let mut error = cause;

        loop {
            if !self.config.retry.should_retry(*failures) {
                return Err(CdcError::retries_exhausted("reconnect", *failures + 1, error));
            }
            let delay = self.config.retry.delay_for_attempt(*failures);
            *failures += 1;
            self.stats.record_retry();
            warn!(
                attempt = *failures,
                max_retries = self.config.retry.max_retries(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Change stream failed, reconnecting"
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.recv() => return Err(CdcError::Shutdown),
            }

            match reader.reconnect(resume.clone()).await {
                Ok(()) => {
                    self.stats.record_reconnect();
                    self.set_state(PipelineState::Streaming);
                    info!(
                        resume = %resume.as_ref().map(LogPosition::to_string).unwrap_or_else(|| "start".into()),
                        "Reconnected change stream"
                    );
                    return Ok(());
                }
                Err(e) if e.is_retriable() => error = e,
                Err(e) => return Err(e),
            }
        }
    }

    async fn finish_on_stop(
        &self,
        acc: &mut BatchAccumulator,
        mut committed: Option<Watermark>,
        shutdown: &mut Shutdown,
    ) -> Result<PipelineOutcome> {
        if self.config.drain_on_shutdown {
            if let Some(batch) = acc.flush() {
                info!(events = batch.len(), "Draining pending batch");
                if let Err(e) = self.commit(batch, &mut committed, shutdown).await {
                    return self.stop_or_fail(e, committed);
                }
            }
        } else {
            let abandoned = acc.discard();
            if abandoned > 0 {
                info!(abandoned, "Abandoning pending events");
            }
        }

        self.set_state(PipelineState::Stopped);
        info!(key = %self.config.key, "Pipeline stopped");
        Ok(PipelineOutcome::Stopped { watermark: committed })
    }

    /// Commit whatever is pending once the source's startup position is read.
    async fn finish_caught_up(
        &self,
        acc: &mut BatchAccumulator,
        mut committed: Option<Watermark>,
        shutdown: &mut Shutdown,
    ) -> Result<PipelineOutcome> {
        if let Some(batch) = acc.flush() {
            if let Err(e) = self.commit(batch, &mut committed, shutdown).await {
                return self.stop_or_fail(e, committed);
            }
        }
        self.set_state(PipelineState::Stopped);
        info!(key = %self.config.key, "Caught up with source");
        Ok(PipelineOutcome::CaughtUp { watermark: committed })
    }

    fn stop_or_fail(&self, e: CdcError, committed: Option<Watermark>) -> Result<PipelineOutcome> {
        if e.is_shutdown() {
            self.set_state(PipelineState::Stopped);
            info!(key = %self.config.key, "Pipeline stopped during retry");
            Ok(PipelineOutcome::Stopped { watermark: committed })
        } else {
            Err(e)
        }
    }

    fn set_state(&self, next: PipelineState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == PipelineState::Fatal {
                return false;
            }
            debug!(from = %current, to = %next, "Pipeline state change");
            *current = next;
            true
        });
    }
}
