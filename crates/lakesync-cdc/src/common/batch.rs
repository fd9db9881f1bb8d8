//! # Batch accumulation
//!
//! Buffers change events into bounded batches. A batch is emitted when
//! either `max_events` events are buffered or `max_wait` has elapsed since
//! the first buffered event, whichever comes first.
//!
//! The accumulator keeps events in arrival order. It never deduplicates or
//! reorders, and never holds more than `max_events` events: the caller must
//! commit a full batch before pushing again.
//!
//! ## Usage
//!
//! ```ignore
//! use lakesync_cdc::common::{BatchAccumulator, BatchConfig};
//!
//! let config = BatchConfig::builder()
//!     .max_events(1000)
//!     .max_wait(Duration::from_secs(5))
//!     .build();
//! let mut acc = BatchAccumulator::new(config);
//!
//! if let Some(batch) = acc.push(event) {
//!     commit(batch).await?;
//! }
//! ```

use crate::common::{CdcError, ChangeEvent, ChangeKind, LogPosition, Result};
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for batch accumulation.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum events per batch
    pub max_events: usize,
    /// Maximum time the first buffered event may wait
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_events: 1000,
            max_wait: Duration::from_secs(5),
        }
    }
}

impl BatchConfig {
    /// Create a new builder.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_events == 0 {
            return Err(CdcError::config("batch max_events must be greater than 0"));
        }
        if self.max_wait.is_zero() {
            return Err(CdcError::config("batch max_wait must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder for BatchConfig.
#[derive(Default)]
pub struct BatchConfigBuilder {
    max_events: Option<usize>,
    max_wait: Option<Duration>,
}

impl BatchConfigBuilder {
    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = Some(n);
        self
    }

    pub fn max_wait(mut self, d: Duration) -> Self {
        self.max_wait = Some(d);
        self
    }

    pub fn build(self) -> BatchConfig {
        let default = BatchConfig::default();
        BatchConfig {
            max_events: self.max_events.unwrap_or(default.max_events),
            max_wait: self.max_wait.unwrap_or(default.max_wait),
        }
    }
}

/// An ordered group of events committed as one atomic append.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Events in arrival order
    pub events: Vec<ChangeEvent>,
    /// Batch sequence number (1-based, per accumulator)
    pub sequence: u64,
    /// When the first event was buffered
    pub opened_at: Instant,
    /// When the batch was emitted
    pub flushed_at: Instant,
}

impl Batch {
    /// Number of events in batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if batch is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Position of the last event, the watermark candidate for this batch.
    pub fn last_position(&self) -> Option<&LogPosition> {
        self.events.last().map(|e| &e.position)
    }

    /// Position of the first event.
    pub fn first_position(&self) -> Option<&LogPosition> {
        self.events.first().map(|e| &e.position)
    }

    /// Time the oldest event waited before flush.
    pub fn wait_time(&self) -> Duration {
        self.flushed_at.duration_since(self.opened_at)
    }

    /// Count events by kind.
    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts::default();
        for event in &self.events {
            match event.kind {
                ChangeKind::Insert => counts.inserts += 1,
                ChangeKind::Update => counts.updates += 1,
                ChangeKind::Delete => counts.deletes += 1,
            }
        }
        counts
    }
}

/// Counts of events by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

/// Count/time bounded event buffer.
#[derive(Debug)]
pub struct BatchAccumulator {
    config: BatchConfig,
    events: Vec<ChangeEvent>,
    opened_at: Option<Instant>,
    sequence: u64,
}

impl BatchAccumulator {
    pub fn new(config: BatchConfig) -> Self {
        let capacity = config.max_events;
        Self {
            config,
            events: Vec::with_capacity(capacity),
            opened_at: None,
            sequence: 0,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Buffer an event.
    ///
    /// Returns the batch when it reached `max_events`.
    pub fn push(&mut self, event: ChangeEvent) -> Option<Batch> {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.events.push(event);

        if self.events.len() >= self.config.max_events {
            self.take_batch()
        } else {
            None
        }
    }

    /// Emit whatever is buffered.
    pub fn flush(&mut self) -> Option<Batch> {
        self.take_batch()
    }

    /// Emit the buffer if its oldest event has waited `max_wait`.
    pub fn flush_if_expired(&mut self) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if Instant::now() >= deadline => self.take_batch(),
            _ => None,
        }
    }

    /// When the current buffer must be flushed, `None` if empty.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.config.max_wait)
    }

    /// Drop buffered events without emitting them.
    ///
    /// Returns the number of discarded events.
    pub fn discard(&mut self) -> usize {
        let n = self.events.len();
        self.events.clear();
        self.opened_at = None;
        n
    }

    /// Get current buffer size.
    pub fn pending(&self) -> usize {
        self.events.len()
    }

    /// Number of batches emitted so far.
    pub fn emitted(&self) -> u64 {
        self.sequence
    }

    fn take_batch(&mut self) -> Option<Batch> {
        let opened_at = self.opened_at.take()?;
        if self.events.is_empty() {
            return None;
        }
        let events = std::mem::replace(
            &mut self.events,
            Vec::with_capacity(self.config.max_events),
        );
        self.sequence += 1;

        Some(Batch {
            events,
            sequence: self.sequence,
            opened_at,
            flushed_at: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::RowImage;

    fn make_event(kind: ChangeKind, offset: u64) -> ChangeEvent {
        let pos = LogPosition::new("mysql-bin.000001", offset);
        let row = RowImage::new().with("id", offset as i64);
        match kind {
            ChangeKind::Insert => ChangeEvent::insert("shop", "orders", row, pos),
            ChangeKind::Update => ChangeEvent::update("shop", "orders", row.clone(), row, pos),
            ChangeKind::Delete => ChangeEvent::delete("shop", "orders", row, pos),
        }
    }

    #[test]
    fn test_batch_config_builder() {
        let config = BatchConfig::builder()
            .max_events(500)
            .max_wait(Duration::from_millis(50))
            .build();

        assert_eq!(config.max_events, 500);
        assert_eq!(config.max_wait, Duration::from_millis(50));
        assert!(config.validate().is_ok());
        assert!(BatchConfig::builder().max_events(0).build().validate().is_err());
    }

    #[test]
    fn test_flush_on_max_events_preserves_order() {
        let mut acc = BatchAccumulator::new(BatchConfig::builder().max_events(3).build());

        assert!(acc.push(make_event(ChangeKind::Insert, 10)).is_none());
        assert!(acc.push(make_event(ChangeKind::Update, 11)).is_none());
        let batch = acc.push(make_event(ChangeKind::Delete, 12)).unwrap();

        let offsets: Vec<_> = batch.events.iter().map(|e| e.position.offset).collect();
        assert_eq!(offsets, vec![10, 11, 12]);
        assert_eq!(batch.last_position().unwrap().offset, 12);
        assert_eq!(batch.first_position().unwrap().offset, 10);
        assert_eq!(acc.pending(), 0);
        assert!(acc.deadline().is_none());
    }

    #[test]
    fn test_force_flush() {
        let mut acc = BatchAccumulator::new(BatchConfig::default());
        assert!(acc.flush().is_none());

        acc.push(make_event(ChangeKind::Insert, 1));
        acc.push(make_event(ChangeKind::Insert, 2));

        let batch = acc.flush().unwrap();
        assert_eq!(batch.len(), 2);
        assert!(acc.flush().is_none());
    }

    #[test]
    fn test_batch_counts() {
        let mut acc = BatchAccumulator::new(BatchConfig::builder().max_events(10).build());
        acc.push(make_event(ChangeKind::Insert, 1));
        acc.push(make_event(ChangeKind::Insert, 2));
        acc.push(make_event(ChangeKind::Update, 3));
        acc.push(make_event(ChangeKind::Delete, 4));

        let counts = acc.flush().unwrap().counts();
        assert_eq!(counts.inserts, 2);
        assert_eq!(counts.updates, 1);
        assert_eq!(counts.deletes, 1);
    }

    #[test]
    fn test_batch_sequence_numbers() {
        let mut acc = BatchAccumulator::new(BatchConfig::builder().max_events(1).build());

        let b1 = acc.push(make_event(ChangeKind::Insert, 1)).unwrap();
        let b2 = acc.push(make_event(ChangeKind::Insert, 2)).unwrap();
        let b3 = acc.push(make_event(ChangeKind::Insert, 3)).unwrap();

        assert_eq!((b1.sequence, b2.sequence, b3.sequence), (1, 2, 3));
        assert_eq!(acc.emitted(), 3);
    }

    #[test]
    fn test_discard_resets_buffer() {
        let mut acc = BatchAccumulator::new(BatchConfig::default());
        acc.push(make_event(ChangeKind::Insert, 1));
        acc.push(make_event(ChangeKind::Insert, 2));

        assert_eq!(acc.discard(), 2);
        assert_eq!(acc.pending(), 0);
        assert!(acc.deadline().is_none());
        assert!(acc.flush().is_none());
        assert_eq!(acc.emitted(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_measured_from_first_event() {
        let config = BatchConfig::builder()
            .max_events(100)
            .max_wait(Duration::from_secs(5))
            .build();
        let mut acc = BatchAccumulator::new(config);

        acc.push(make_event(ChangeKind::Insert, 1));
        let deadline = acc.deadline().unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        acc.push(make_event(ChangeKind::Insert, 2));
        assert_eq!(acc.deadline(), Some(deadline));
        assert!(acc.flush_if_expired().is_none());

        tokio::time::advance(Duration::from_secs(2)).await;
        let batch = acc.flush_if_expired().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.wait_time(), Duration::from_secs(5));
    }
}
