//! Table metadata lookups
//!
//! Binlog rows events carry column types but not names, so names come from
//! INFORMATION_SCHEMA and are cached per table.

use super::type_mapper::ColumnInfo;
use crate::common::Result;
use mysql_async::prelude::*;
use mysql_async::Pool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Ordered column list of one table.
pub type TableColumns = Arc<Vec<ColumnInfo>>;

/// Load column metadata in ordinal order.
pub async fn load_columns(pool: &Pool, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut conn = pool.get_conn().await?;
    let rows: Vec<(String, String, String)> = conn
        .exec(
            r"SELECT COLUMN_NAME, DATA_TYPE, COLUMN_TYPE
              FROM INFORMATION_SCHEMA.COLUMNS
              WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
              ORDER BY ORDINAL_POSITION",
            (schema, table),
        )
        .await?;

    Ok(rows
        .into_iter()
        .map(|(name, data_type, column_type)| ColumnInfo::new(name, data_type, column_type))
        .collect())
}

/// Primary key columns of a table in key order, empty when it has none.
pub async fn primary_key_columns(pool: &Pool, schema: &str, table: &str) -> Result<Vec<String>> {
    let mut conn = pool.get_conn().await?;
    let keys: Vec<String> = conn
        .exec(
            r"SELECT COLUMN_NAME
              FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
              WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
              ORDER BY ORDINAL_POSITION",
            (schema, table),
        )
        .await?;
    debug!(schema, table, key = ?keys, "Loaded primary key");
    Ok(keys)
}

/// Per-table column cache.
#[derive(Debug, Default)]
pub struct ColumnCache {
    tables: RwLock<HashMap<(String, String), TableColumns>>,
}

impl ColumnCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Columns for `schema.table`.
    ///
    /// Reloads when the cached list does not have `expected` columns, which
    /// happens after an ALTER TABLE.
    pub async fn get(
        &self,
        pool: &Pool,
        schema: &str,
        table: &str,
        expected: Option<usize>,
    ) -> Result<TableColumns> {
        let key = (schema.to_string(), table.to_string());
        if let Some(cols) = self.tables.read().await.get(&key) {
            if expected.map_or(true, |n| n == cols.len()) {
                return Ok(Arc::clone(cols));
            }
        }

        let cols = Arc::new(load_columns(pool, schema, table).await?);
        info!(schema, table, columns = cols.len(), "Loaded table columns");
        self.tables.write().await.insert(key, Arc::clone(&cols));
        Ok(cols)
    }

    /// Seed the cache, bypassing INFORMATION_SCHEMA.
    pub async fn insert(&self, schema: &str, table: &str, columns: Vec<ColumnInfo>) {
        self.tables
            .write()
            .await
            .insert((schema.to_string(), table.to_string()), Arc::new(columns));
    }
}
