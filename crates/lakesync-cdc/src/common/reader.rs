//! # Change stream reader
//!
//! Wraps a [`ChangeSource`] subscription for one table and guarantees that
//! every emitted event is strictly after the resume position and strictly
//! after the previously emitted event, whatever the source replays on
//! reconnect.
//!
//! Log entries that carry no change for the table come out as
//! [`StreamItem::Progress`], so the coordinator can tell how far the source
//! has read even while the table is idle.

use crate::common::{CdcError, ChangeSource, ChangeStream, LogPosition, Result, StreamItem, TableFilter};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info};

/// Ordered, single-table view over a change source.
pub struct ChangeStreamReader {
    source: Arc<dyn ChangeSource>,
    filter: TableFilter,
    stream: Option<ChangeStream>,
    last_emitted: Option<LogPosition>,
    skipped: u64,
}

impl ChangeStreamReader {
    pub fn new(source: Arc<dyn ChangeSource>, filter: TableFilter) -> Self {
        Self {
            source,
            filter,
            stream: None,
            last_emitted: None,
            skipped: 0,
        }
    }

    pub fn filter(&self) -> &TableFilter {
        &self.filter
    }

    /// Events dropped as replays or as other tables.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Subscribe strictly after `after`, or from the start of the log.
    pub async fn open(&mut self, after: Option<LogPosition>) -> Result<()> {
        self.stream = None;
        let stream = self.source.subscribe(after.as_ref(), &self.filter).await?;
        info!(
            source = self.source.name(),
            table = %self.filter,
            after = %after.as_ref().map(ToString::to_string).unwrap_or_else(|| "start".into()),
            "Opened change stream"
        );
        self.stream = Some(stream);
        self.last_emitted = after;
        Ok(())
    }

    /// Next change for the table, or progress past entries that had none.
    ///
    /// Changes are validated and strictly increasing. Progress is only
    /// reported beyond the last emitted position. `Ok(None)` means the source
    /// ended the stream. Dropping the returned future before it completes
    /// loses no event.
    pub async fn next_event(&mut self) -> Result<Option<StreamItem>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CdcError::invalid_state("change stream is not open"))?;

        loop {
            let Some(item) = stream.next().await else {
                return Ok(None);
            };
            let item = item?;

            if let Some(last) = &self.last_emitted {
                if item.position() <= last {
                    if matches!(item, StreamItem::Change(_)) {
                        debug!(position = %item.position(), last = %last, "Skipping replayed event");
                        self.skipped += 1;
                    }
                    continue;
                }
            }

            match item {
                StreamItem::Change(event) if !self.filter.matches(&event) => {
                    self.skipped += 1;
                    return Ok(Some(StreamItem::Progress(event.position)));
                }
                StreamItem::Change(event) => {
                    event.validate()?;
                    self.last_emitted = Some(event.position.clone());
                    return Ok(Some(StreamItem::Change(event)));
                }
                progress @ StreamItem::Progress(_) => return Ok(Some(progress)),
            }
        }
    }

    /// Drop the current subscription and resume strictly after `committed`.
    pub async fn reconnect(&mut self, committed: Option<LogPosition>) -> Result<()> {
        self.close();
        self.open(committed).await
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(table = %self.filter, "Closed change stream");
        }
    }
}
