//! # Common CDC types and traits
//!
//! Database-agnostic building blocks of the replication pipeline:
//!
//! - [`ChangeEvent`] - One row-level change with its [`LogPosition`]
//! - [`SqlValue`] / [`RowImage`] - Closed column value model
//! - [`ChangeSource`] / [`SnapshotSource`] - Traits for source implementations
//! - [`ChangeStreamReader`] - Ordered, resumable single-table stream
//! - [`BatchAccumulator`] - Count/time bounded batching
//! - [`TableWriter`] - Atomic, versioned appends to the target table
//! - [`WatermarkStore`] - Durable per-key resume position
//! - [`BackfillLoader`] - Full table load ahead of streaming
//! - [`Pipeline`] - Coordinator tying everything together
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Common Module                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ChangeSource   ←─── MySqlBinlogSource, MemoryChangeSource  │
//! │  SnapshotSource ←─── MySqlSnapshotSource                    │
//! │  Reader         ←─── Table filter, replay suppression       │
//! │  Accumulator    ←─── max_events / max_wait batching         │
//! │  TableWriter    ←─── File, Iceberg, in-memory tables        │
//! │  WatermarkStore ←─── File, Postgres, in-memory stores       │
//! │  Resilience     ←─── Retry with backoff, shutdown-aware     │
//! │  Pipeline       ←─── Backfill / streaming coordinator       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod backfill;
mod batch;
mod error;
mod event;
pub mod memory;
mod pipeline;
mod position;
mod reader;
mod resilience;
mod shutdown;
mod traits;
mod value;
mod watermark;
mod writer;

pub use backfill::*;
pub use batch::*;
pub use error::*;
pub use event::*;
pub use memory::{EndOfLog, MemoryChangeSource, MemorySnapshotSource};
pub use pipeline::*;
pub use position::*;
pub use reader::*;
pub use resilience::*;
pub use shutdown::*;
pub use traits::*;
pub use value::*;
pub use watermark::*;
pub use writer::*;
