//! MySQL snapshot source
//!
//! Chunked full-table reads for the backfill. Tables with a primary key use
//! keyset pagination (`WHERE (k1, k2) > (?, ?) ORDER BY k1, k2 LIMIT n`).
//! Tables without one fall back to `ORDER BY <every column> LIMIT n OFFSET m`,
//! so successive pages see one total order.

use super::schema::{primary_key_columns, ColumnCache, TableColumns};
use super::source::{current_binlog_position, MySqlSourceConfig};
use super::type_mapper::{decode_value, to_param, ColumnInfo};
use crate::common::{
    CdcError, LogPosition, Result, RowImage, ScanCursor, SnapshotChunk, SnapshotSource,
    SqlValue, TableFilter,
};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Params, Pool, Row};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// How a table is paged.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ScanPlan {
    /// Primary key columns and their positions in the select list
    Keyset { key: Vec<String>, key_indexes: Vec<usize> },
    Offset,
}

/// Quote an identifier with backticks.
fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

fn ident_list<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    names.into_iter().map(quote_ident).collect::<Vec<_>>().join(", ")
}

fn select_list(columns: &[ColumnInfo]) -> String {
    ident_list(columns.iter().map(|c| c.name.as_str()))
}

/// SQL and parameters for the chunk after `cursor`, plus the offset it
/// starts at.
fn chunk_query(
    plan: &ScanPlan,
    columns: &[ColumnInfo],
    table: &str,
    cursor: Option<&ScanCursor>,
    chunk_size: usize,
) -> Result<(String, Params, u64)> {
    let select = select_list(columns);
    match (plan, cursor) {
        (ScanPlan::Keyset { key, .. }, None) => {
            let k = ident_list(key.iter().map(String::as_str));
            Ok((
                format!("SELECT {select} FROM {table} ORDER BY {k} LIMIT {chunk_size}"),
                Params::Empty,
                0,
            ))
        }
        (ScanPlan::Keyset { key, .. }, Some(ScanCursor::AfterKey(last))) if last.len() == key.len() => {
            let k = ident_list(key.iter().map(String::as_str));
            let placeholders = vec!["?"; key.len()].join(", ");
            Ok((
                format!(
                    "SELECT {select} FROM {table} WHERE ({k}) > ({placeholders}) ORDER BY {k} LIMIT {chunk_size}"
                ),
                Params::Positional(last.iter().map(to_param).collect()),
                0,
            ))
        }
        (ScanPlan::Offset, None) => Ok((
            format!("SELECT {select} FROM {table} ORDER BY {select} LIMIT {chunk_size}"),
            Params::Empty,
            0,
        )),
        (ScanPlan::Offset, Some(ScanCursor::Offset(m))) => Ok((
            format!("SELECT {select} FROM {table} ORDER BY {select} LIMIT {chunk_size} OFFSET {m}"),
            Params::Empty,
            *m,
        )),
        (_, Some(other)) => Err(CdcError::invalid_state(format!(
            "cursor {other:?} does not match the scan plan for {table}"
        ))),
    }
}

/// MySQL implementation of [`SnapshotSource`].
///
/// The scan plan is chosen on the first fetch; an instance serves one table.
pub struct MySqlSnapshotSource {
    pool: Pool,
    columns: ColumnCache,
    plan: OnceCell<ScanPlan>,
}

impl MySqlSnapshotSource {
    pub fn new(config: &MySqlSourceConfig) -> Result<Self> {
        Ok(Self::with_pool(config.pool()?))
    }

    pub fn with_pool(pool: Pool) -> Self {
        Self {
            pool,
            columns: ColumnCache::new(),
            plan: OnceCell::new(),
        }
    }

    async fn table_columns(&self, filter: &TableFilter) -> Result<TableColumns> {
        let columns = self
            .columns
            .get(&self.pool, &filter.schema, &filter.table, None)
            .await?;
        if columns.is_empty() {
            return Err(CdcError::config(format!("table {filter} does not exist")));
        }
        Ok(columns)
    }

    async fn plan(&self, filter: &TableFilter, columns: &TableColumns) -> Result<&ScanPlan> {
        self.plan
            .get_or_try_init(|| async {
                let key = primary_key_columns(&self.pool, &filter.schema, &filter.table).await?;
                let plan = if key.is_empty() {
                    warn!(
                        table = %filter,
                        "No primary key, falling back to OFFSET pagination ordered by every column"
                    );
                    ScanPlan::Offset
                } else {
                    let key_indexes = key
                        .iter()
                        .map(|k| {
                            columns.iter().position(|c| &c.name == k).ok_or_else(|| {
                                CdcError::replication(format!("primary key column {k} not found in {filter}"))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    info!(table = %filter, key = ?key, "Scanning by primary key");
                    ScanPlan::Keyset { key, key_indexes }
                };
                Ok::<_, CdcError>(plan)
            })
            .await
    }
}

#[async_trait]
impl SnapshotSource for MySqlSnapshotSource {
    async fn reference_position(&self) -> Result<LogPosition> {
        let position = current_binlog_position(&self.pool).await?;
        info!(position = %position, "Captured backfill reference position");
        Ok(position)
    }

    async fn estimate_row_count(&self, filter: &TableFilter) -> Result<Option<u64>> {
        let mut conn = self.pool.get_conn().await?;
        let rows: Option<Option<u64>> = conn
            .exec_first(
                r"SELECT TABLE_ROWS FROM INFORMATION_SCHEMA.TABLES
                  WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                (&filter.schema, &filter.table),
            )
            .await?;
        Ok(rows.flatten())
    }

    async fn fetch_chunk(
        &self,
        filter: &TableFilter,
        cursor: Option<&ScanCursor>,
        chunk_size: usize,
    ) -> Result<SnapshotChunk> {
        let columns = self.table_columns(filter).await?;
        let plan = self.plan(filter, &columns).await?;
        let table = format!("{}.{}", quote_ident(&filter.schema), quote_ident(&filter.table));
        let (sql, params, offset) = chunk_query(plan, &columns, &table, cursor, chunk_size)?;

        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<Row> = conn.exec(sql, params).await?;
        let full = rows.len() >= chunk_size;

        let mut images = Vec::with_capacity(rows.len());
        for row in rows {
            let values = row.unwrap();
            let mut image = RowImage::with_capacity(columns.len());
            for (value, column) in values.iter().zip(columns.iter()) {
                image.push(column.name.clone(), decode_value(value, column)?);
            }
            images.push(image);
        }

        let next = if !full {
            None
        } else {
            match plan {
                ScanPlan::Keyset { key_indexes, .. } => {
                    let last: Vec<SqlValue> = images
                        .last()
                        .map(|img| {
                            let values: Vec<&SqlValue> = img.iter().map(|(_, v)| v).collect();
                            key_indexes
                                .iter()
                                .map(|i| values.get(*i).map_or(SqlValue::Null, |v| (*v).clone()))
                                .collect()
                        })
                        .unwrap_or_default();
                    Some(ScanCursor::AfterKey(last))
                }
                ScanPlan::Offset => Some(ScanCursor::Offset(offset + images.len() as u64)),
            }
        };

        debug!(table = %filter, rows = images.len(), more = next.is_some(), "Fetched snapshot chunk");
        Ok(SnapshotChunk { rows: images, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("orders"), "`orders`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    fn columns() -> Vec<ColumnInfo> {
        vec![
            ColumnInfo::new("region", "varchar", "varchar(8)"),
            ColumnInfo::new("id", "int", "int"),
            ColumnInfo::new("note", "text", "text"),
        ]
    }

    #[test]
    fn test_composite_key_uses_row_comparison() {
        let plan = ScanPlan::Keyset {
            key: vec!["region".into(), "id".into()],
            key_indexes: vec![0, 1],
        };
        let cursor = ScanCursor::AfterKey(vec![SqlValue::String("eu".into()), SqlValue::Integer(7)]);
        let (sql, params, _) = chunk_query(&plan, &columns(), "`shop`.`orders`", Some(&cursor), 100).unwrap();

        assert_eq!(
            sql,
            "SELECT `region`, `id`, `note` FROM `shop`.`orders` \
             WHERE (`region`, `id`) > (?, ?) ORDER BY `region`, `id` LIMIT 100"
        );
        assert!(matches!(params, Params::Positional(p) if p.len() == 2));
    }

    #[test]
    fn test_offset_scan_is_totally_ordered() {
        let (first, _, _) = chunk_query(&ScanPlan::Offset, &columns(), "`t`", None, 10).unwrap();
        let (next, _, offset) =
            chunk_query(&ScanPlan::Offset, &columns(), "`t`", Some(&ScanCursor::Offset(10)), 10).unwrap();

        assert_eq!(first, "SELECT `region`, `id`, `note` FROM `t` ORDER BY `region`, `id`, `note` LIMIT 10");
        assert!(next.ends_with("ORDER BY `region`, `id`, `note` LIMIT 10 OFFSET 10"));
        assert_eq!(offset, 10);
    }

    #[test]
    fn test_cursor_must_match_plan() {
        let plan = ScanPlan::Keyset {
            key: vec!["id".into()],
            key_indexes: vec![1],
        };
        let err = chunk_query(&plan, &columns(), "`t`", Some(&ScanCursor::Offset(3)), 10).unwrap_err();
        assert!(matches!(err, CdcError::InvalidState(_)));
    }

    #[test]
    fn test_select_list() {
        let cols = vec![
            ColumnInfo::new("id", "int", "int"),
            ColumnInfo::new("order", "varchar", "varchar(10)"),
        ];
        assert_eq!(select_list(&cols), "`id`, `order`");
    }

    #[tokio::test]
    #[ignore = "requires a MySQL server"]
    async fn test_snapshot_live() {
        let config = MySqlSourceConfig::new("127.0.0.1", "root")
            .with_password(std::env::var("MYSQL_PASSWD").unwrap_or_default());
        let source = MySqlSnapshotSource::new(&config).unwrap();
        let filter = TableFilter::new(
            std::env::var("CDC_SCHEMA").unwrap_or_else(|_| "test".into()),
            std::env::var("CDC_TABLE").unwrap_or_else(|_| "orders".into()),
        );
        let chunk = source.fetch_chunk(&filter, None, 10).await.unwrap();
        assert!(chunk.rows.len() <= 10);
    }
}
