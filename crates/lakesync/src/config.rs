//! Service configuration
//!
//! Loaded from an optional YAML file, then overlaid with environment
//! variables. `${VAR}` and `${VAR:-default}` references in the file are
//! expanded before parsing.
//!
//! ```yaml
//! connection_name: orders-sync
//! mode: cdc
//! source:
//!   schema: shop
//!   table: orders
//!   host: mysql.internal
//!   password: ${MYSQL_PASSWD}
//! batch:
//!   size: 1000
//!   flush_interval_ms: 5000
//! table_store:
//!   kind: iceberg
//!   catalog_uri: http://catalog:8181
//!   warehouse: s3://lake
//! watermark_store:
//!   kind: postgres
//!   postgres_url: postgres://cdc@metadata/cdc
//! ```
//!
//! Iceberg stores (table or watermark) share the catalog at
//! `table_store.catalog_uri`. Without one, only a dry run may start, on an
//! in-memory catalog.

use anyhow::{bail, Context, Result};
use lakesync_cdc::common::{BatchConfig, InitialPosition, PipelineConfig, PipelineMode, RetryConfig};
use lakesync_cdc::WatermarkKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LakesyncConfig {
    /// Logical name of this replication, part of the watermark key
    pub connection_name: String,
    pub mode: PipelineMode,
    pub source: SourceSettings,
    pub batch: BatchSettings,
    pub retry: RetrySettings,
    pub table_store: TableStoreSettings,
    pub watermark_store: WatermarkStoreSettings,
    /// Stop after committing everything up to the startup position
    pub until_caught_up: bool,
    /// Commit buffered events on shutdown
    pub drain_on_shutdown: bool,
    /// Allow Iceberg stores without a catalog URI, on an in-memory catalog
    pub dry_run: bool,
}

impl Default for LakesyncConfig {
    fn default() -> Self {
        Self {
            connection_name: String::new(),
            mode: PipelineMode::Cdc,
            source: SourceSettings::default(),
            batch: BatchSettings::default(),
            retry: RetrySettings::default(),
            table_store: TableStoreSettings::default(),
            watermark_store: WatermarkStoreSettings::default(),
            until_caught_up: false,
            drain_on_shutdown: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceSettings {
    pub schema: String,
    pub table: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Replica id presented to MySQL
    pub server_id: u32,
    pub initial_position: InitialPosition,
    /// Rows per backfill query
    pub snapshot_chunk_size: usize,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            schema: String::new(),
            table: String::new(),
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: None,
            server_id: 1,
            initial_position: InitialPosition::Earliest,
            snapshot_chunk_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchSettings {
    pub size: usize,
    pub flush_interval_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            size: 1000,
            flush_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStoreKind {
    #[default]
    File,
    Iceberg,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TableStoreSettings {
    pub kind: TableStoreKind,
    /// Root of the file table store
    pub data_dir: PathBuf,
    /// Iceberg REST catalog, required for Iceberg stores unless `dry_run`
    pub catalog_uri: Option<String>,
    pub warehouse: Option<String>,
}

impl Default for TableStoreSettings {
    fn default() -> Self {
        Self {
            kind: TableStoreKind::File,
            data_dir: PathBuf::from("./lakesync-data"),
            catalog_uri: None,
            warehouse: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkStoreKind {
    #[default]
    File,
    Postgres,
    /// `cdc_metadata.watermarks` on the table store's Iceberg catalog
    Iceberg,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct WatermarkStoreSettings {
    pub kind: WatermarkStoreKind,
    /// Directory of the file store, `<data_dir>/watermarks` when unset
    pub dir: Option<PathBuf>,
    pub postgres_url: Option<String>,
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid value '{value}' for {name}: {e}"))
}

impl LakesyncConfig {
    /// Load `path` if given, then apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content, |name| std::env::var(name).ok());
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&expanded).context("Failed to parse config")
    }

    /// Expand `${VAR}` and `${VAR:-default}` using `lookup`.
    pub fn expand_env_vars(content: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let default = caps.get(2).map(|m| m.as_str());
                lookup(&caps[1]).unwrap_or_else(|| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Override settings from environment variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(v) = get("CDC_SCHEMA") {
            self.source.schema = v;
        }
        if let Some(v) = get("CDC_TABLE") {
            self.source.table = v;
        }
        if let Some(v) = get("CDC_MODE") {
            self.mode = parse_env("CDC_MODE", &v)?;
        }
        if let Some(v) = get("CONNECTION_NAME") {
            self.connection_name = v;
        }
        if let Some(v) = get("MYSQL_HOST") {
            self.source.host = v;
        }
        if let Some(v) = get("MYSQL_PORT") {
            self.source.port = parse_env("MYSQL_PORT", &v)?;
        }
        if let Some(v) = get("MYSQL_USER") {
            self.source.user = v;
        }
        if let Some(v) = get("MYSQL_PASSWD") {
            self.source.password = Some(v);
        }
        if let Some(v) = get("CDC_SERVER_ID") {
            self.source.server_id = parse_env("CDC_SERVER_ID", &v)?;
        }
        if let Some(v) = get("BATCH_SIZE") {
            self.batch.size = parse_env("BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("FLUSH_INTERVAL_MS") {
            self.batch.flush_interval_ms = parse_env("FLUSH_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("LAKESYNC_TABLE_STORE") {
            self.table_store.kind = match v.to_ascii_lowercase().as_str() {
                "file" => TableStoreKind::File,
                "iceberg" => TableStoreKind::Iceberg,
                other => bail!("invalid value '{other}' for LAKESYNC_TABLE_STORE, expected file or iceberg"),
            };
        }
        if let Some(v) = get("LAKESYNC_DATA_DIR") {
            self.table_store.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ICEBERG_CATALOG_URI") {
            self.table_store.catalog_uri = Some(v);
        }
        if let Some(v) = get("ICEBERG_WAREHOUSE") {
            self.table_store.warehouse = Some(v);
        }
        if let Some(v) = get("LAKESYNC_WATERMARK_STORE") {
            self.watermark_store.kind = match v.to_ascii_lowercase().as_str() {
                "file" => WatermarkStoreKind::File,
                "postgres" => WatermarkStoreKind::Postgres,
                "iceberg" => WatermarkStoreKind::Iceberg,
                other => bail!(
                    "invalid value '{other}' for LAKESYNC_WATERMARK_STORE, expected file, postgres or iceberg"
                ),
            };
        }
        if let Some(v) = get("WATERMARK_POSTGRES_URL") {
            self.watermark_store.postgres_url = Some(v);
        }
        if let Some(v) = get("LAKESYNC_DRY_RUN") {
            self.dry_run = parse_env("LAKESYNC_DRY_RUN", &v)?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.connection_name.is_empty() {
            bail!("connection_name is required (CONNECTION_NAME)");
        }
        if self.source.schema.is_empty() {
            bail!("source.schema is required (CDC_SCHEMA)");
        }
        if self.source.table.is_empty() {
            bail!("source.table is required (CDC_TABLE)");
        }
        if self.batch.size == 0 {
            bail!("batch.size must be greater than 0");
        }
        if self.watermark_store.kind == WatermarkStoreKind::Postgres
            && self.watermark_store.postgres_url.is_none()
        {
            bail!("watermark_store.postgres_url is required for the postgres store (WATERMARK_POSTGRES_URL)");
        }
        if self.uses_iceberg() && self.table_store.catalog_uri.is_none() && !self.dry_run {
            bail!(
                "table_store.catalog_uri is required for Iceberg stores (ICEBERG_CATALOG_URI); \
                 use a dry run for an in-memory catalog"
            );
        }

        if !cfg!(feature = "mysql") {
            bail!("this build has no MySQL support; enable the 'mysql' feature");
        }
        if self.table_store.kind == TableStoreKind::Iceberg && !cfg!(feature = "iceberg") {
            bail!("table store 'iceberg' requires the 'iceberg' feature");
        }
        if self.watermark_store.kind == WatermarkStoreKind::Postgres && !cfg!(feature = "postgres") {
            bail!("watermark store 'postgres' requires the 'postgres' feature");
        }
        if self.watermark_store.kind == WatermarkStoreKind::Iceberg && !cfg!(feature = "iceberg") {
            bail!("watermark store 'iceberg' requires the 'iceberg' feature");
        }

        self.pipeline_config()
            .validate()
            .context("invalid pipeline configuration")?;
        Ok(())
    }

    /// Whether the table or watermark store lives on the Iceberg catalog.
    pub fn uses_iceberg(&self) -> bool {
        self.table_store.kind == TableStoreKind::Iceberg
            || self.watermark_store.kind == WatermarkStoreKind::Iceberg
    }

    pub fn watermark_key(&self) -> WatermarkKey {
        WatermarkKey::new(
            &self.connection_name,
            self.source.server_id,
            &self.source.schema,
            &self.source.table,
        )
    }

    pub fn watermark_dir(&self) -> PathBuf {
        self.watermark_store
            .dir
            .clone()
            .unwrap_or_else(|| self.table_store.data_dir.join("watermarks"))
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let batch = BatchConfig::builder()
            .max_events(self.batch.size)
            .max_wait(Duration::from_millis(self.batch.flush_interval_ms))
            .build();
        let retry = RetryConfig::builder()
            .max_retries(self.retry.max_retries)
            .retry_delay(Duration::from_millis(self.retry.initial_delay_ms))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .build();

        PipelineConfig::new(self.watermark_key(), self.mode)
            .with_batch(batch)
            .with_retry(retry)
            .with_initial_position(self.source.initial_position)
            .with_until_caught_up(self.until_caught_up)
            .with_drain_on_shutdown(self.drain_on_shutdown)
            .with_snapshot_chunk_size(self.source.snapshot_chunk_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_env_var_expansion() {
        let lookup = env(&[("MY_HOST", "db.internal")]);
        let expanded = LakesyncConfig::expand_env_vars("host: ${MY_HOST}", &lookup);
        assert_eq!(expanded, "host: db.internal");

        let expanded = LakesyncConfig::expand_env_vars("port: ${MY_PORT:-3307}", &lookup);
        assert_eq!(expanded, "port: 3307");

        let expanded = LakesyncConfig::expand_env_vars("password: ${MISSING}", &lookup);
        assert_eq!(expanded, "password: ");
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
connection_name: orders-sync
mode: backfill
source:
  schema: shop
  table: orders
  host: mysql.internal
  server_id: 42
batch:
  size: 500
table_store:
  kind: iceberg
  catalog_uri: http://catalog:8181
watermark_store:
  kind: postgres
  postgres_url: postgres://cdc@metadata/cdc
"#;
        let config = LakesyncConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.connection_name, "orders-sync");
        assert_eq!(config.mode, PipelineMode::Backfill);
        assert_eq!(config.source.port, 3306);
        assert_eq!(config.source.server_id, 42);
        assert_eq!(config.batch.size, 500);
        assert_eq!(config.batch.flush_interval_ms, 5000);
        assert_eq!(config.table_store.kind, TableStoreKind::Iceberg);
        assert_eq!(config.watermark_store.kind, WatermarkStoreKind::Postgres);
        assert!(config.drain_on_shutdown);

        let key = config.watermark_key();
        assert_eq!(key, WatermarkKey::new("orders-sync", 42, "shop", "orders"));
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut config = LakesyncConfig::from_yaml("connection_name: from-file\nbatch:\n  size: 10\n").unwrap();
        config
            .apply_env(env(&[
                ("CONNECTION_NAME", "from-env"),
                ("CDC_SCHEMA", "shop"),
                ("CDC_TABLE", "orders"),
                ("CDC_MODE", "backfill"),
                ("BATCH_SIZE", "250"),
                ("FLUSH_INTERVAL_MS", "100"),
                ("LAKESYNC_WATERMARK_STORE", "Postgres"),
                ("WATERMARK_POSTGRES_URL", "postgres://localhost/meta"),
                ("MYSQL_PASSWD", ""),
            ]))
            .unwrap();

        assert_eq!(config.connection_name, "from-env");
        assert_eq!(config.mode, PipelineMode::Backfill);
        assert_eq!(config.batch.size, 250);
        assert_eq!(config.watermark_store.kind, WatermarkStoreKind::Postgres);
        assert_eq!(config.source.password, None);

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.batch.max_events, 250);
        assert_eq!(pipeline.batch.max_wait, Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_env_values_rejected() {
        let mut config = LakesyncConfig::default();
        assert!(config.apply_env(env(&[("BATCH_SIZE", "many")])).is_err());
        assert!(config.apply_env(env(&[("CDC_MODE", "snapshot")])).is_err());
        assert!(config.apply_env(env(&[("LAKESYNC_TABLE_STORE", "delta")])).is_err());
    }

    #[test]
    fn test_validate_requires_identity() {
        let mut config = LakesyncConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("connection_name"));

        config.connection_name = "orders-sync".into();
        config.source.schema = "shop".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("CDC_TABLE"));

        config.source.table = "orders".into();
        config.batch.size = 0;
        assert!(config.validate().is_err());
    }

    fn identified() -> LakesyncConfig {
        let mut config = LakesyncConfig::default();
        config.connection_name = "orders-sync".into();
        config.source.schema = "shop".into();
        config.source.table = "orders".into();
        config
    }

    #[test]
    fn test_iceberg_stores_require_catalog_uri() {
        let mut config = identified();
        config.table_store.kind = TableStoreKind::Iceberg;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ICEBERG_CATALOG_URI"), "{err}");

        let mut config = identified();
        config
            .apply_env(env(&[("LAKESYNC_WATERMARK_STORE", "iceberg")]))
            .unwrap();
        assert_eq!(config.watermark_store.kind, WatermarkStoreKind::Iceberg);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ICEBERG_CATALOG_URI"), "{err}");
    }

    #[cfg(feature = "iceberg")]
    #[test]
    fn test_dry_run_allows_memory_catalog() {
        let mut config = identified();
        config.table_store.kind = TableStoreKind::Iceberg;
        config.apply_env(env(&[("LAKESYNC_DRY_RUN", "true")])).unwrap();
        assert!(config.dry_run);
        config.validate().unwrap();

        config.dry_run = false;
        config.table_store.catalog_uri = Some("http://catalog:8181".into());
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_expands_env_references() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lakesync.yaml");
        std::fs::write(
            &path,
            "connection_name: orders-sync\nsource:\n  schema: shop\n  table: orders\n  port: ${LAKESYNC_TEST_UNSET_PORT:-3307}\n",
        )
        .unwrap();

        let config = LakesyncConfig::from_file(&path).unwrap();
        assert_eq!(config.source.port, 3307);
        assert_eq!(config.watermark_key(), WatermarkKey::new("orders-sync", 1, "shop", "orders"));
        assert!(LakesyncConfig::from_file(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_default_watermark_dir() {
        let mut config = LakesyncConfig::default();
        config.table_store.data_dir = PathBuf::from("/var/lib/lakesync");
        assert_eq!(config.watermark_dir(), PathBuf::from("/var/lib/lakesync/watermarks"));
    }
}
