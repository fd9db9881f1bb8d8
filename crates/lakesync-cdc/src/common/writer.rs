//! # Table writers
//!
//! A [`TableWriter`] appends one [`Batch`] to the target table as a single
//! atomic operation: every event of the batch becomes visible together, or
//! none does. Each successful append advances the table version by exactly
//! one.
//!
//! ## Row layout
//!
//! One row per change event:
//!
//! | Column           | Type               | Contents                                   |
//! |------------------|--------------------|--------------------------------------------|
//! | `event_type`     | string             | `insert` / `update` / `delete`             |
//! | `timestamp`      | timestamp (UTC µs) | capture time                               |
//! | `log_file`       | string             | binlog file                                |
//! | `log_position`   | long               | offset within `log_file`                   |
//! | `payload`        | string (JSON)      | new row (insert/update), old row (delete)  |
//! | `before_payload` | string (JSON)      | old row for update/delete, else null       |
//! | `server_id`      | long               | source server id                           |

use crate::common::{Batch, CdcError, ChangeEvent, ChangeKind, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Table snapshot version. `0` means the table has no data yet.
pub type TableVersion = u64;

/// Atomic, versioned append target.
#[async_trait]
pub trait TableWriter: Send + Sync {
    /// Create the target table if it does not exist yet.
    async fn ensure_table(&self) -> Result<()>;

    /// Append all events of `batch` as one atomic commit.
    ///
    /// Returns the table version created by this append.
    async fn append(&self, batch: &Batch) -> Result<TableVersion>;

    /// Latest committed version.
    async fn current_version(&self) -> Result<TableVersion>;

    /// Human-readable backend name for logs.
    fn name(&self) -> &'static str;
}

/// Shared table writer handle.
pub type SharedTableWriter = Arc<dyn TableWriter>;

/// Encoded form of a change event in the target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub log_file: String,
    pub log_position: i64,
    pub payload: String,
    pub before_payload: Option<String>,
    pub server_id: i64,
}

impl TableRow {
    /// Encode one event.
    pub fn from_event(event: &ChangeEvent) -> Result<Self> {
        event.validate()?;
        let payload = event.payload().ok_or_else(|| {
            CdcError::decode(format!("{} event at {} has no payload", event.kind, event.position))
        })?;
        let before_payload = match event.kind {
            ChangeKind::Insert => None,
            ChangeKind::Update | ChangeKind::Delete => event
                .before
                .as_ref()
                .map(|row| serde_json::to_string(&row.to_json()))
                .transpose()?,
        };

        Ok(Self {
            event_type: event.kind.as_str().to_string(),
            timestamp: event.captured_at,
            log_file: event.position.file.clone(),
            log_position: event.position.offset as i64,
            payload: serde_json::to_string(&payload.to_json())?,
            before_payload,
            server_id: event.server_id as i64,
        })
    }

    /// Encode a whole batch, preserving order.
    pub fn encode_batch(batch: &Batch) -> Result<Vec<Self>> {
        batch.events.iter().map(Self::from_event).collect()
    }
}

// ============================================================================
// In-memory writer
// ============================================================================

/// In-memory versioned table.
///
/// Keeps every append as its own snapshot so tests can check what each
/// version contains. `fail_next` makes the next appends fail with a
/// retriable write error without changing the table.
#[derive(Debug, Default)]
pub struct MemoryTableWriter {
    appends: Mutex<Vec<Vec<ChangeEvent>>>,
    fail_next: AtomicU32,
    failed: AtomicU32,
}

impl MemoryTableWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` append calls.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of append calls that were rejected.
    pub fn failed_appends(&self) -> u32 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Events of each committed append, in commit order.
    pub async fn appends(&self) -> Vec<Vec<ChangeEvent>> {
        self.appends.lock().await.clone()
    }

    /// All committed events, in commit order.
    pub async fn rows(&self) -> Vec<ChangeEvent> {
        self.appends.lock().await.iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl TableWriter for MemoryTableWriter {
    async fn ensure_table(&self) -> Result<()> {
        Ok(())
    }

    async fn append(&self, batch: &Batch) -> Result<TableVersion> {
        if batch.is_empty() {
            return Err(CdcError::invalid_state("refusing to append an empty batch"));
        }
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(CdcError::write("injected append failure"));
        }
        // Same validation as persistent writers
        TableRow::encode_batch(batch)?;

        let mut appends = self.appends.lock().await;
        appends.push(batch.events.clone());
        Ok(appends.len() as TableVersion)
    }

    async fn current_version(&self) -> Result<TableVersion> {
        Ok(self.appends.lock().await.len() as TableVersion)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Local file table
// ============================================================================

/// Manifest published for each committed version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileManifest {
    pub version: TableVersion,
    /// Data file, relative to the table directory
    pub data_file: String,
    pub row_count: usize,
    pub committed_at: DateTime<Utc>,
}

/// Versioned table on the local filesystem.
///
/// Layout under `<root>/<namespace>/<table>/`:
///
/// ```text
/// data/v00000000000000000001.jsonl           rows of version 1 (JSON lines)
/// metadata/v00000000000000000001.manifest.json
/// metadata/version-hint                      latest version (advisory)
/// ```
///
/// An append writes its data file first and then publishes the manifest with
/// an atomic rename; the manifest rename is the commit point. Data files
/// without a manifest are leftovers of failed appends and are never read.
pub struct FileTableWriter {
    table_dir: PathBuf,
    fsync: bool,
    /// Cached latest version, `None` until first use
    version: Mutex<Option<TableVersion>>,
}

impl FileTableWriter {
    pub fn new(root: impl AsRef<Path>, namespace: &str, table: &str) -> Result<Self> {
        for part in [namespace, table] {
            if part.is_empty() || part.contains('/') || part.contains('\\') {
                return Err(CdcError::config(format!("invalid table identifier part '{part}'")));
            }
        }
        Ok(Self {
            table_dir: root.as_ref().join(namespace).join(table),
            fsync: true,
            version: Mutex::new(None),
        })
    }

    /// Disable fsync (tests).
    pub fn without_fsync(mut self) -> Self {
        self.fsync = false;
        self
    }

    pub fn table_dir(&self) -> &Path {
        &self.table_dir
    }

    fn data_dir(&self) -> PathBuf {
        self.table_dir.join("data")
    }

    fn metadata_dir(&self) -> PathBuf {
        self.table_dir.join("metadata")
    }

    fn manifest_path(&self, version: TableVersion) -> PathBuf {
        self.metadata_dir()
            .join(format!("v{version:020}.manifest.json"))
    }

    fn hint_path(&self) -> PathBuf {
        self.metadata_dir().join("version-hint")
    }

    /// Write `bytes` to `path` via temp file and rename.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(|e| CdcError::write(format!("{}: {e}", temp_path.display())))?;
        file.write_all(bytes)
            .await
            .map_err(|e| CdcError::write(format!("{}: {e}", temp_path.display())))?;
        if self.fsync {
            file.sync_all()
                .await
                .map_err(|e| CdcError::write(format!("{}: {e}", temp_path.display())))?;
        }
        drop(file);
        fs::rename(&temp_path, path)
            .await
            .map_err(|e| CdcError::write(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    /// Find the latest version: start at the hint, then probe forward for
    /// manifests published after the hint was last written.
    async fn scan_version(&self) -> Result<TableVersion> {
        let mut version = match fs::read_to_string(self.hint_path()).await {
            Ok(s) => s.trim().parse::<TableVersion>().unwrap_or(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        while fs::try_exists(self.manifest_path(version + 1)).await? {
            version += 1;
        }
        Ok(version)
    }

    /// Manifest of a committed version.
    pub async fn manifest(&self, version: TableVersion) -> Result<FileManifest> {
        let bytes = fs::read(self.manifest_path(version)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Rows of every committed version, in commit order.
    pub async fn read_rows(&self) -> Result<Vec<TableRow>> {
        let latest = self.current_version().await?;
        let mut rows = Vec::new();
        for version in 1..=latest {
            let manifest = self.manifest(version).await?;
            let contents = fs::read_to_string(self.table_dir.join(&manifest.data_file)).await?;
            for line in contents.lines().filter(|l| !l.is_empty()) {
                rows.push(serde_json::from_str(line)?);
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl TableWriter for FileTableWriter {
    async fn ensure_table(&self) -> Result<()> {
        fs::create_dir_all(self.data_dir()).await?;
        fs::create_dir_all(self.metadata_dir()).await?;
        let mut cached = self.version.lock().await;
        let version = self.scan_version().await?;
        *cached = Some(version);
        info!(table = %self.table_dir.display(), version, "Table ready");
        Ok(())
    }

    async fn append(&self, batch: &Batch) -> Result<TableVersion> {
        if batch.is_empty() {
            return Err(CdcError::invalid_state("refusing to append an empty batch"));
        }
        let rows = TableRow::encode_batch(batch)?;

        let mut cached = self.version.lock().await;
        let current = match *cached {
            Some(v) => v,
            None => self.scan_version().await?,
        };
        let version = current + 1;

        let mut body = Vec::with_capacity(rows.len() * 128);
        for row in &rows {
            serde_json::to_writer(&mut body, row)?;
            body.push(b'\n');
        }
        let data_file = format!("data/v{version:020}.jsonl");
        self.write_atomic(&self.table_dir.join(&data_file), &body).await?;

        let manifest = FileManifest {
            version,
            data_file,
            row_count: rows.len(),
            committed_at: Utc::now(),
        };
        let manifest_path = self.manifest_path(version);
        if fs::try_exists(&manifest_path).await? {
            return Err(CdcError::invalid_state(format!(
                "version {version} already committed by another writer"
            )));
        }
        self.write_atomic(&manifest_path, &serde_json::to_vec_pretty(&manifest)?)
            .await?;
        *cached = Some(version);

        // Committed: a stale hint only costs a forward probe on the next scan
        if let Err(e) = self
            .write_atomic(&self.hint_path(), version.to_string().as_bytes())
            .await
        {
            warn!(version, error = %e, "Failed to update version hint");
        }

        debug!(version, rows = rows.len(), "Appended batch");
        Ok(version)
    }

    async fn current_version(&self) -> Result<TableVersion> {
        let cached = *self.version.lock().await;
        match cached {
            Some(v) => Ok(v),
            None => self.scan_version().await,
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BatchAccumulator, BatchConfig, LogPosition, RowImage};
    use tempfile::tempdir;

    fn batch_of(offsets: &[u64]) -> Batch {
        let mut acc = BatchAccumulator::new(BatchConfig::builder().max_events(1000).build());
        for &offset in offsets {
            let pos = LogPosition::new("mysql-bin.000001", offset);
            acc.push(ChangeEvent::insert(
                "shop",
                "orders",
                RowImage::new().with("id", offset as i64),
                pos,
            ));
        }
        acc.flush().unwrap()
    }

    #[test]
    fn test_row_encoding() {
        let pos = LogPosition::new("mysql-bin.000004", 990);
        let before = RowImage::new().with("id", 1i64).with("status", "new");
        let after = RowImage::new().with("id", 1i64).with("status", "paid");
        let event = ChangeEvent::update("shop", "orders", before, after, pos).with_server_id(3);

        let row = TableRow::from_event(&event).unwrap();
        assert_eq!(row.event_type, "update");
        assert_eq!(row.log_file, "mysql-bin.000004");
        assert_eq!(row.log_position, 990);
        assert_eq!(row.server_id, 3);
        assert_eq!(row.payload, r#"{"id":1,"status":"paid"}"#);
        assert_eq!(row.before_payload.as_deref(), Some(r#"{"id":1,"status":"new"}"#));
    }

    #[tokio::test]
    async fn test_memory_writer_versions_and_failures() {
        let writer = MemoryTableWriter::new();
        assert_eq!(writer.append(&batch_of(&[1, 2])).await.unwrap(), 1);

        writer.fail_next(2);
        assert!(writer.append(&batch_of(&[3])).await.is_err());
        assert!(writer.append(&batch_of(&[3])).await.is_err());
        assert_eq!(writer.current_version().await.unwrap(), 1);
        assert_eq!(writer.failed_appends(), 2);

        assert_eq!(writer.append(&batch_of(&[3])).await.unwrap(), 2);
        let offsets: Vec<_> = writer.rows().await.iter().map(|e| e.position.offset).collect();
        assert_eq!(offsets, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_file_writer_appends_are_versioned() {
        let dir = tempdir().unwrap();
        let writer = FileTableWriter::new(dir.path(), "shop", "orders")
            .unwrap()
            .without_fsync();
        writer.ensure_table().await.unwrap();
        assert_eq!(writer.current_version().await.unwrap(), 0);

        assert_eq!(writer.append(&batch_of(&[10, 11])).await.unwrap(), 1);
        assert_eq!(writer.append(&batch_of(&[12])).await.unwrap(), 2);

        let manifest = writer.manifest(2).await.unwrap();
        assert_eq!(manifest.row_count, 1);

        let positions: Vec<_> = writer
            .read_rows()
            .await
            .unwrap()
            .iter()
            .map(|r| r.log_position)
            .collect();
        assert_eq!(positions, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn test_file_writer_recovers_version_after_restart() {
        let dir = tempdir().unwrap();
        {
            let writer = FileTableWriter::new(dir.path(), "shop", "orders").unwrap();
            writer.ensure_table().await.unwrap();
            writer.append(&batch_of(&[1])).await.unwrap();
            writer.append(&batch_of(&[2])).await.unwrap();
        }

        // Stale hint: manifest 2 exists, hint still says 1
        let writer = FileTableWriter::new(dir.path(), "shop", "orders").unwrap();
        fs::write(writer.hint_path(), b"1").await.unwrap();
        writer.ensure_table().await.unwrap();
        assert_eq!(writer.current_version().await.unwrap(), 2);
        assert_eq!(writer.append(&batch_of(&[3])).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_file_writer_ignores_orphaned_data_files() {
        let dir = tempdir().unwrap();
        let writer = FileTableWriter::new(dir.path(), "shop", "orders").unwrap();
        writer.ensure_table().await.unwrap();
        writer.append(&batch_of(&[1])).await.unwrap();

        // Data file of a failed append, never published
        fs::write(
            writer.table_dir().join("data/v00000000000000000002.jsonl"),
            b"garbage\n",
        )
        .await
        .unwrap();

        assert_eq!(writer.read_rows().await.unwrap().len(), 1);
        assert_eq!(writer.append(&batch_of(&[2])).await.unwrap(), 2);
        assert_eq!(writer.read_rows().await.unwrap().len(), 2);
    }

    #[test]
    fn test_file_writer_rejects_bad_identifiers() {
        assert!(FileTableWriter::new("/tmp", "", "orders").is_err());
        assert!(FileTableWriter::new("/tmp", "shop", "a/b").is_err());
    }
}
