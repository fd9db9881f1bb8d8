//! # Watermarks
//!
//! Durable record of the last replication position committed to the table
//! store, one record per (connection, server id, schema, table).
//!
//! ## Invariants
//!
//! - The stored position never exceeds the last position durable in the
//!   table store; callers upsert only after a successful append.
//! - Each upsert replaces the whole record atomically. Stores never merge
//!   fields and never delete-then-insert.
//! - Stores do not enforce monotonic positions; the coordinator does.
//!
//! ## Persisted layout
//!
//! All backends share the column layout downstream tools query:
//!
//! | Column              | Type      |
//! |---------------------|-----------|
//! | `connection_name`   | string    |
//! | `server_id`         | long      |
//! | `schema`            | string    |
//! | `table`             | string    |
//! | `log_file`          | string    |
//! | `log_position`      | long      |
//! | `backfill_complete` | boolean   |
//! | `updated_at`        | timestamp |
//!
//! The first four columns form the identifier.

use crate::common::{CdcError, LogPosition, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

/// Identifier of a watermark record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatermarkKey {
    pub connection_name: String,
    pub server_id: u32,
    pub schema: String,
    pub table: String,
}

impl WatermarkKey {
    pub fn new(
        connection_name: impl Into<String>,
        server_id: u32,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            connection_name: connection_name.into(),
            server_id,
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Reject keys with empty parts.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("connection_name", &self.connection_name),
            ("schema", &self.schema),
            ("table", &self.table),
        ] {
            if value.trim().is_empty() {
                return Err(CdcError::config(format!(
                    "watermark key field '{name}' must not be empty"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for WatermarkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}.{}",
            self.connection_name, self.server_id, self.schema, self.table
        )
    }
}

/// Last committed replication position for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WatermarkRecord", into = "WatermarkRecord")]
pub struct Watermark {
    pub key: WatermarkKey,
    pub position: LogPosition,
    pub backfill_complete: bool,
    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    /// Create a watermark stamped with the current time.
    pub fn new(key: WatermarkKey, position: LogPosition, backfill_complete: bool) -> Self {
        Self {
            key,
            position,
            backfill_complete,
            updated_at: Utc::now(),
        }
    }

    /// Same key and backfill flag at a later position.
    pub fn advance_to(&self, position: LogPosition) -> Self {
        Self::new(self.key.clone(), position, self.backfill_complete)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} (backfill_complete={}, updated_at={})",
            self.key,
            self.position,
            self.backfill_complete,
            self.updated_at.to_rfc3339()
        )
    }
}

/// Flat row layout shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WatermarkRecord {
    connection_name: String,
    server_id: i64,
    schema: String,
    table: String,
    log_file: String,
    log_position: i64,
    backfill_complete: bool,
    updated_at: DateTime<Utc>,
}

impl From<Watermark> for WatermarkRecord {
    fn from(w: Watermark) -> Self {
        Self {
            connection_name: w.key.connection_name,
            server_id: w.key.server_id as i64,
            schema: w.key.schema,
            table: w.key.table,
            log_file: w.position.file,
            log_position: w.position.offset as i64,
            backfill_complete: w.backfill_complete,
            updated_at: w.updated_at,
        }
    }
}

impl From<WatermarkRecord> for Watermark {
    fn from(r: WatermarkRecord) -> Self {
        Self {
            key: WatermarkKey::new(r.connection_name, r.server_id as u32, r.schema, r.table),
            position: LogPosition::new(r.log_file, r.log_position.max(0) as u64),
            backfill_complete: r.backfill_complete,
            updated_at: r.updated_at,
        }
    }
}

/// Durable watermark storage.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Read the record for `key`, `None` if the pipeline never committed.
    async fn read(&self, key: &WatermarkKey) -> Result<Option<Watermark>>;

    /// Insert or fully replace the record for `watermark.key`.
    async fn upsert(&self, watermark: &Watermark) -> Result<()>;

    /// Human-readable backend name for logs.
    fn name(&self) -> &'static str;
}

/// Shared watermark store handle.
pub type SharedWatermarkStore = Arc<dyn WatermarkStore>;

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory watermark store (tests and dry runs).
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    records: RwLock<HashMap<WatermarkKey, Watermark>>,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn read(&self, key: &WatermarkKey) -> Result<Option<Watermark>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn upsert(&self, watermark: &Watermark) -> Result<()> {
        watermark.key.validate()?;
        self.records
            .write()
            .await
            .insert(watermark.key.clone(), watermark.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// File store
// ============================================================================

/// Watermark store keeping one JSON document per key.
///
/// The file is named `{connection}.{server_id}.{schema}.{table}.json` with
/// `%` and `.` in each part percent-encoded, so distinct keys never share a
/// file.
///
/// Upserts write a temp file, fsync it, then rename it over the record, so a
/// crash leaves either the old or the new record, never a torn one.
pub struct FileWatermarkStore {
    /// Base directory for watermark files
    base_dir: PathBuf,
    /// Read-through cache
    cache: RwLock<HashMap<WatermarkKey, Watermark>>,
    /// Whether to fsync after writes
    fsync: bool,
}

impl FileWatermarkStore {
    /// Create a new store rooted at `base_dir`.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Create a store with custom options.
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;

        Ok(Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            fsync,
        })
    }

    fn file_path(&self, key: &WatermarkKey) -> Result<PathBuf> {
        key.validate()?;
        for part in [&key.connection_name, &key.schema, &key.table] {
            if part.contains('/') || part.contains('\\') {
                return Err(CdcError::config(format!(
                    "invalid watermark key '{key}': path separators are not allowed"
                )));
            }
        }
        Ok(self.base_dir.join(format!(
            "{}.{}.{}.{}.json",
            escape_file_part(&key.connection_name),
            key.server_id,
            escape_file_part(&key.schema),
            escape_file_part(&key.table)
        )))
    }
}

/// Percent-encode the characters that would make a dotted file name ambiguous.
fn escape_file_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '.' => escaped.push_str("%2E"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn read(&self, key: &WatermarkKey) -> Result<Option<Watermark>> {
        {
            let cache = self.cache.read().await;
            if let Some(w) = cache.get(key) {
                return Ok(Some(w.clone()));
            }
        }

        let file_path = self.file_path(key)?;
        let contents = match fs::read(&file_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CdcError::checkpoint(format!(
                "failed to read {}: {e}",
                file_path.display()
            ))),
        };

        let watermark: Watermark = serde_json::from_slice(&contents)
            .map_err(|e| CdcError::serialization(format!("corrupt watermark {}: {e}", file_path.display())))?;
        if watermark.key != *key {
            return Err(CdcError::invalid_state(format!(
                "watermark file {} holds key {}, expected {key}",
                file_path.display(),
                watermark.key
            )));
        }

        self.cache
            .write()
            .await
            .insert(key.clone(), watermark.clone());
        Ok(Some(watermark))
    }

    async fn upsert(&self, watermark: &Watermark) -> Result<()> {
        let file_path = self.file_path(&watermark.key)?;
        let temp_path = file_path.with_extension("json.tmp");

        let json = serde_json::to_vec_pretty(watermark)?;

        let io = |e: std::io::Error| CdcError::checkpoint(format!("{}: {e}", temp_path.display()));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(io)?;
        file.write_all(&json).await.map_err(io)?;
        if self.fsync {
            file.sync_all().await.map_err(io)?;
        }
        drop(file);

        fs::rename(&temp_path, &file_path)
            .await
            .map_err(|e| CdcError::checkpoint(format!("{}: {e}", file_path.display())))?;

        self.cache
            .write()
            .await
            .insert(watermark.key.clone(), watermark.clone());

        debug!(key = %watermark.key, position = %watermark.position, "Saved watermark");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
