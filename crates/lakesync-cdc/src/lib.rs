//! # lakesync-cdc - Change data capture into lakehouse tables
//!
//! Replicates row changes of one MySQL table into an append-only, versioned
//! table and tracks progress with a durable watermark, so a restarted
//! pipeline resumes exactly after the last committed event.
//!
//! ## Features
//!
//! - `mysql` - MySQL binlog source and chunked snapshot reader
//! - `postgres` - PostgreSQL watermark store
//! - `iceberg` - Apache Iceberg table writer and watermark store (REST or in-memory catalog)
//! - `full` - All of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │   MySQL    │──▶│   Reader    │──▶│ Accumulator │──▶│ TableWriter  │
//! │   Binlog   │   │ (filtered)  │   │ (N events / │   │ (atomic      │
//! └────────────┘   └─────────────┘   │   T millis) │   │   append)    │
//!                                    └─────────────┘   └──────┬───────┘
//!                                                             │ success
//!                                                             ▼
//!                  resume after P ◀──────────────────  ┌──────────────┐
//!                                                      │WatermarkStore│
//!                                                      │  (upsert P)  │
//!                                                      └──────────────┘
//! ```
//!
//! The watermark is written only after the append succeeded. A crash between
//! the two replays at most one batch.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> lakesync_cdc::Result<()> {
//! use lakesync_cdc::common::{MemoryChangeSource, MemoryTableWriter};
//! use lakesync_cdc::{
//!     MemoryWatermarkStore, Pipeline, PipelineConfig, PipelineMode, WatermarkKey,
//! };
//! use std::sync::Arc;
//!
//! let key = WatermarkKey::new("orders-sync", 1, "shop", "orders");
//! let pipeline = Pipeline::builder(PipelineConfig::new(key, PipelineMode::Cdc))
//!     .change_source(Arc::new(MemoryChangeSource::new(vec![])))
//!     .writer(Arc::new(MemoryTableWriter::new()))
//!     .watermark_store(Arc::new(MemoryWatermarkStore::new()))
//!     .build()?;
//!
//! let (_tx, rx) = tokio::sync::broadcast::channel(1);
//! pipeline.run(rx).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API Organization
//!
//! ### Tier 1: Core Types (crate root)
//! Events, positions, errors and the pipeline itself.
//!
//! ### Tier 2: Storage (crate root)
//! Table writers and watermark stores that need no optional feature.
//!
//! ### Tier 3: Advanced Types (`common` module)
//! Building blocks for custom sources and writers, accessed via `common::*`.

pub mod common;

// =============================================================================
// TIER 1: Core Types
// =============================================================================

pub use common::{
    CdcError, ChangeEvent, ChangeKind, ErrorCategory, LogPosition, Pipeline, PipelineConfig,
    PipelineMode, PipelineOutcome, PipelineState, Result, RowImage, SqlValue, WatermarkKey,
};

// =============================================================================
// TIER 2: Storage
// =============================================================================

pub use common::{
    FileTableWriter, FileWatermarkStore, MemoryWatermarkStore, TableWriter, TableVersion,
    Watermark, WatermarkStore,
};

// =============================================================================
// TIER 3: Advanced Types - Available via `common::` module
// =============================================================================
// Not re-exported at crate root:
//
// Sources (for custom change sources):
//   - common::ChangeSource, ChangeStream, StreamItem, SnapshotSource, ScanCursor
//   - common::ChangeStreamReader, TableFilter
//   - common::MemoryChangeSource, MemorySnapshotSource
//
// Batching and retry:
//   - common::BatchAccumulator, BatchConfig, Batch
//   - common::RetryConfig, RetryConfigBuilder
//
// Backfill:
//   - common::BackfillLoader, BackfillReport

// MySQL source - feature-gated
#[cfg(feature = "mysql")]
pub mod mysql;

// PostgreSQL watermark store - feature-gated
#[cfg(feature = "postgres")]
pub mod postgres;

// Apache Iceberg writer - feature-gated
#[cfg(feature = "iceberg")]
pub mod iceberg;
