//! PostgreSQL watermark store
//!
//! Persists watermarks in `cdc_metadata.watermarks`:
//!
//! ```sql
//! CREATE TABLE cdc_metadata.watermarks (
//!     connection_name   TEXT        NOT NULL,
//!     server_id         BIGINT      NOT NULL,
//!     schema            TEXT        NOT NULL,
//!     "table"           TEXT        NOT NULL,
//!     log_file          TEXT        NOT NULL,
//!     log_position      BIGINT      NOT NULL,
//!     backfill_complete BOOLEAN     NOT NULL,
//!     updated_at        TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (connection_name, server_id, schema, "table")
//! )
//! ```
//!
//! Upserts are a single `INSERT ... ON CONFLICT DO UPDATE` statement, so a
//! record is always replaced as a whole.

use crate::common::{
    CdcError, LogPosition, Result, Watermark, WatermarkKey, WatermarkStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, info, warn};

const CREATE_SCHEMA: &str = "CREATE SCHEMA IF NOT EXISTS cdc_metadata";

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS cdc_metadata.watermarks (
        connection_name   TEXT        NOT NULL,
        server_id         BIGINT      NOT NULL,
        schema            TEXT        NOT NULL,
        "table"           TEXT        NOT NULL,
        log_file          TEXT        NOT NULL,
        log_position      BIGINT      NOT NULL,
        backfill_complete BOOLEAN     NOT NULL DEFAULT FALSE,
        updated_at        TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (connection_name, server_id, schema, "table")
    )
"#;

const UPSERT: &str = r#"
    INSERT INTO cdc_metadata.watermarks
        (connection_name, server_id, schema, "table", log_file, log_position, backfill_complete, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (connection_name, server_id, schema, "table")
    DO UPDATE SET
        log_file = EXCLUDED.log_file,
        log_position = EXCLUDED.log_position,
        backfill_complete = EXCLUDED.backfill_complete,
        updated_at = EXCLUDED.updated_at
"#;

const SELECT: &str = r#"
    SELECT log_file, log_position, backfill_complete, updated_at
    FROM cdc_metadata.watermarks
    WHERE connection_name = $1 AND server_id = $2 AND schema = $3 AND "table" = $4
"#;

/// Watermark store in a PostgreSQL metadata database.
///
/// Only use a dedicated metadata database: the store creates the
/// `cdc_metadata` schema if it is missing.
pub struct PostgresWatermarkStore {
    client: RwLock<Arc<Client>>,
    url: Option<String>,
}

impl std::fmt::Debug for PostgresWatermarkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresWatermarkStore")
            .field("reconnects", &self.url.is_some())
            .finish()
    }
}

async fn connect(url: &str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "Watermark database connection error");
        }
    });
    Ok(client)
}

impl PostgresWatermarkStore {
    /// Connect with a `postgres://` URL and create the table if needed.
    ///
    /// The store reconnects with the same URL if the connection drops.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = connect(url).await?;
        let store = Self {
            client: RwLock::new(Arc::new(client)),
            url: Some(url.to_string()),
        };
        store.ensure_table().await?;
        info!("Connected to watermark database");
        Ok(store)
    }

    /// Use an existing client and create the table if needed.
    pub async fn new(client: Arc<Client>) -> Result<Self> {
        let store = Self {
            client: RwLock::new(client),
            url: None,
        };
        store.ensure_table().await?;
        Ok(store)
    }

    async fn ensure_table(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(&format!("{CREATE_SCHEMA}; {CREATE_TABLE}"))
            .await
            .map_err(|e| CdcError::config(format!("failed to create watermark table: {e}")))?;
        Ok(())
    }

    /// Live client, reconnecting first if the connection was closed.
    async fn client(&self) -> Result<Arc<Client>> {
        let current = Arc::clone(&*self.client.read().await);
        if !current.is_closed() {
            return Ok(current);
        }
        let Some(url) = &self.url else {
            return Err(CdcError::checkpoint("watermark database connection is closed"));
        };

        let mut guard = self.client.write().await;
        if guard.is_closed() {
            warn!("Watermark database connection closed, reconnecting");
            let client = connect(url)
                .await
                .map_err(|e| CdcError::checkpoint(format!("reconnect failed: {e}")))?;
            *guard = Arc::new(client);
        }
        Ok(Arc::clone(&*guard))
    }
}

fn key_params(key: &WatermarkKey) -> (i64, &str, &str, &str) {
    (
        i64::from(key.server_id),
        key.connection_name.as_str(),
        key.schema.as_str(),
        key.table.as_str(),
    )
}

fn from_row(key: &WatermarkKey, row: &Row) -> Result<Watermark> {
    let log_file: String = row.try_get(0)?;
    let log_position: i64 = row.try_get(1)?;
    let backfill_complete: bool = row.try_get(2)?;
    let updated_at: DateTime<Utc> = row.try_get(3)?;

    let offset = u64::try_from(log_position)
        .map_err(|_| CdcError::checkpoint(format!("negative log_position {log_position} for {key}")))?;
    Ok(Watermark {
        key: key.clone(),
        position: LogPosition::new(log_file, offset),
        backfill_complete,
        updated_at,
    })
}

#[async_trait]
impl WatermarkStore for PostgresWatermarkStore {
    async fn read(&self, key: &WatermarkKey) -> Result<Option<Watermark>> {
        let client = self.client().await?;
        let (server_id, connection, schema, table) = key_params(key);
        let row = client
            .query_opt(SELECT, &[&connection, &server_id, &schema, &table])
            .await?;
        row.map(|r| from_row(key, &r)).transpose()
    }

    async fn upsert(&self, watermark: &Watermark) -> Result<()> {
        let client = self.client().await?;
        let (server_id, connection, schema, table) = key_params(&watermark.key);
        let log_position = i64::try_from(watermark.position.offset).map_err(|_| {
            CdcError::checkpoint(format!("log position {} out of range", watermark.position))
        })?;

        client
            .execute(
                UPSERT,
                &[
                    &connection,
                    &server_id,
                    &schema,
                    &table,
                    &watermark.position.file,
                    &log_position,
                    &watermark.backfill_complete,
                    &watermark.updated_at,
                ],
            )
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
