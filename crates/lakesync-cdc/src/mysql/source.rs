//! MySQL binlog change source
//!
//! Connects as a replica and turns row-based binlog events for one table into
//! [`ChangeEvent`]s.
//!
//! # Positions
//!
//! A rows event may carry many rows but has a single end offset in the
//! binlog. Row `i` of `n` is assigned offset `end - (n - 1 - i)`, which lies
//! inside the event's byte range, so every row has its own strictly
//! increasing position and the last row carries the event's real end offset.
//!
//! # Resume
//!
//! Subscribing after `file:offset` streams `file` from its first event so the
//! table map events are seen again, and drops every row at or before the
//! resume offset.
//!
//! # Progress
//!
//! Every binlog event that yields no row change for the table (other tables,
//! XID commits, query events) is reported as [`StreamItem::Progress`] at its
//! end offset. `SHOW MASTER STATUS` points past the last commit event, so a
//! bounded run sees the end of the log even when the table is idle.

use super::schema::ColumnCache;
use super::type_mapper::decode_binlog_value;
use crate::common::{
    CdcError, ChangeEvent, ChangeKind, ChangeSource, ChangeStream, LogPosition, Result,
    RowImage, StreamItem, TableFilter, BINLOG_START_OFFSET,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use mysql_async::binlog::events::{Event, EventData, RowsEventData};
use mysql_async::prelude::*;
use mysql_async::{BinlogStream, BinlogStreamRequest, Opts, Pool, Row};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// MySQL connection settings.
///
/// `Debug` redacts the password.
#[derive(Clone)]
pub struct MySqlSourceConfig {
    /// MySQL host
    pub host: String,
    /// MySQL port (default: 3306)
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Replica server id, unique among all replicas of the source
    pub server_id: u32,
}

impl std::fmt::Debug for MySqlSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlSourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("server_id", &self.server_id)
            .finish()
    }
}

impl Default for MySqlSourceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: None,
            server_id: 1,
        }
    }
}

impl MySqlSourceConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    /// Build a connection pool. Credentials are URL-encoded and the URL
    /// never leaves this function.
    pub fn pool(&self) -> Result<Pool> {
        let user = url::form_urlencoded::byte_serialize(self.user.as_bytes()).collect::<String>();
        let password =
            url::form_urlencoded::byte_serialize(self.password.as_deref().unwrap_or("").as_bytes())
                .collect::<String>();
        let opts = {
            let url = format!("mysql://{}:{}@{}:{}/", user, password, self.host, self.port);
            Opts::from_url(&url)
                .map_err(|e| CdcError::config(format!("invalid MySQL connection settings: {e}")))?
        };
        Ok(Pool::new(opts))
    }
}

/// Current binlog write position.
///
/// Tries `SHOW BINARY LOG STATUS` (MySQL 8.2+) before `SHOW MASTER STATUS`.
pub async fn current_binlog_position(pool: &Pool) -> Result<LogPosition> {
    let mut conn = pool.get_conn().await?;
    let row: Option<Row> = match conn.query_first("SHOW BINARY LOG STATUS").await {
        Ok(row) => row,
        Err(_) => conn.query_first("SHOW MASTER STATUS").await?,
    };

    let row = row.ok_or_else(|| {
        CdcError::replication("binlog status returned no rows, binary logging may be disabled")
    })?;
    let file: String = row
        .get(0)
        .ok_or_else(|| CdcError::replication("binlog status is missing the file name"))?;
    let offset: u64 = row
        .get(1)
        .ok_or_else(|| CdcError::replication("binlog status is missing the position"))?;
    if file.is_empty() {
        return Err(CdcError::replication(
            "binlog status returned an empty file name, binary logging may be disabled",
        ));
    }
    Ok(LogPosition::new(file, offset))
}

/// Oldest binlog file still available on the server.
pub async fn first_binlog_file(pool: &Pool) -> Result<String> {
    let mut conn = pool.get_conn().await?;
    let row: Option<Row> = conn.query_first("SHOW BINARY LOGS").await?;
    row.and_then(|r| r.get::<String, _>(0))
        .ok_or_else(|| CdcError::replication("SHOW BINARY LOGS returned no files"))
}

/// Row-based binlog reader for one MySQL server.
pub struct MySqlBinlogSource {
    config: MySqlSourceConfig,
    pool: Pool,
    columns: Arc<ColumnCache>,
}

impl MySqlBinlogSource {
    pub fn new(config: MySqlSourceConfig) -> Result<Self> {
        let pool = config.pool()?;
        Ok(Self {
            config,
            pool,
            columns: Arc::new(ColumnCache::new()),
        })
    }

    pub fn config(&self) -> &MySqlSourceConfig {
        &self.config
    }

    /// Close pooled connections.
    pub async fn disconnect(self) -> Result<()> {
        self.pool.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeSource for MySqlBinlogSource {
    async fn subscribe(
        &self,
        after: Option<&LogPosition>,
        filter: &TableFilter,
    ) -> Result<ChangeStream> {
        let file = match after {
            Some(p) => p.file.clone(),
            None => first_binlog_file(&self.pool).await?,
        };

        let conn = self.pool.get_conn().await?;
        let request = BinlogStreamRequest::new(self.config.server_id)
            .with_filename(file.as_bytes())
            .with_pos(BINLOG_START_OFFSET);
        let binlog = conn.get_binlog_stream(request).await?;
        info!(
            server_id = self.config.server_id,
            file = %file,
            table = %filter,
            "Started binlog stream"
        );

        let cursor = BinlogCursor {
            binlog,
            file,
            after: after.cloned(),
            filter: filter.clone(),
            pool: self.pool.clone(),
            columns: Arc::clone(&self.columns),
            server_id: self.config.server_id,
            pending: VecDeque::new(),
            done: false,
        };
        Ok(stream::unfold(cursor, |mut cursor| async move {
            cursor.next().await.map(|item| (item, cursor))
        })
        .boxed())
    }

    async fn current_position(&self) -> Result<LogPosition> {
        current_binlog_position(&self.pool).await
    }

    fn name(&self) -> &'static str {
        "mysql"
    }
}

/// Row offsets for an event ending at `end` that holds `rows` rows.
fn row_offsets(end: u64, rows: usize) -> impl Iterator<Item = u64> {
    let rows = rows as u64;
    (0..rows).map(move |i| end - (rows - 1 - i))
}

/// Pull state of one binlog subscription.
struct BinlogCursor {
    binlog: BinlogStream,
    file: String,
    after: Option<LogPosition>,
    filter: TableFilter,
    pool: Pool,
    columns: Arc<ColumnCache>,
    server_id: u32,
    pending: VecDeque<StreamItem>,
    done: bool,
}

impl BinlogCursor {
    async fn next(&mut self) -> Option<Result<StreamItem>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(Ok(item));
            }
            if self.done {
                return None;
            }
            let event = match self.binlog.next().await {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                Some(Ok(event)) => event,
            };
            if let Err(e) = self.handle(event).await {
                self.done = true;
                return Some(Err(e));
            }
        }
    }

    async fn handle(&mut self, event: Event) -> Result<()> {
        let header = event.header();
        let end = u64::from(header.log_pos());
        let captured_at =
            DateTime::<Utc>::from_timestamp(i64::from(header.timestamp()), 0).unwrap_or_else(Utc::now);

        let data = event
            .read_data()
            .map_err(|e| CdcError::decode(format!("malformed binlog event at {}:{end}: {e}", self.file)))?;

        let queued = self.pending.len();
        match data {
            Some(EventData::RotateEvent(rotate)) => {
                let name = rotate.name().into_owned();
                if name != self.file {
                    info!(from = %self.file, to = %name, "Binlog rotated");
                    self.file = name;
                }
                return Ok(());
            }
            Some(EventData::RowsEvent(rows)) => self.handle_rows(rows, end, captured_at).await?,
            _ => trace!(file = %self.file, end, "Skipping binlog event"),
        }

        // Artificial events carry no log position
        if self.pending.len() == queued && end > 0 {
            let position = LogPosition::new(self.file.clone(), end);
            if self.after.as_ref().map_or(true, |a| position > *a) {
                self.pending.push_back(StreamItem::Progress(position));
            }
        }
        Ok(())
    }

    async fn handle_rows(
        &mut self,
        rows_event: RowsEventData<'_>,
        end: u64,
        captured_at: DateTime<Utc>,
    ) -> Result<()> {
        let kind = match &rows_event {
            RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => ChangeKind::Insert,
            RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => ChangeKind::Delete,
            _ => ChangeKind::Update,
        };

        let table_id = rows_event.table_id();
        let tme = self.binlog.get_tme(table_id).ok_or_else(|| {
            CdcError::replication(format!("rows event for unknown table id {table_id}"))
        })?;
        let schema = tme.database_name().into_owned();
        let table = tme.table_name().into_owned();
        if !self.filter.matches_table(&schema, &table) {
            return Ok(());
        }

        let rows = rows_event
            .rows(tme)
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| CdcError::decode(format!("malformed rows event for {schema}.{table}: {e}")))?;
        let columns = self
            .columns
            .get(&self.pool, &schema, &table, Some(tme.columns_count() as usize))
            .await?;

        let row_count = rows.len();
        for ((before, after), offset) in rows.into_iter().zip(row_offsets(end, row_count)) {
            let position = LogPosition::new(self.file.clone(), offset);
            if self.after.as_ref().is_some_and(|a| position <= *a) {
                continue;
            }

            let decode = |row: Option<mysql_async::binlog::row::BinlogRow>| -> Result<Option<RowImage>> {
                let Some(row) = row else { return Ok(None) };
                if row.len() != columns.len() {
                    return Err(CdcError::decode(format!(
                        "{schema}.{table} row has {} columns, table has {}; binlog_row_image must be FULL",
                        row.len(),
                        columns.len()
                    )));
                }
                let mut image = RowImage::with_capacity(columns.len());
                for (i, column) in columns.iter().enumerate() {
                    let value = row
                        .as_ref(i)
                        .ok_or_else(|| CdcError::decode(format!("missing column {}", column.name)))?;
                    image.push(column.name.clone(), decode_binlog_value(value, column)?);
                }
                Ok(Some(image))
            };

            let event = ChangeEvent {
                schema: schema.clone(),
                table: table.clone(),
                kind,
                before: decode(before)?,
                after: decode(after)?,
                position,
                server_id: self.server_id,
                captured_at,
            };
            debug!(kind = %event.kind, position = %event.position, "Decoded row change");
            self.pending.push_back(StreamItem::Change(event));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_offsets_end_at_event_end() {
        assert_eq!(row_offsets(1000, 3).collect::<Vec<_>>(), vec![998, 999, 1000]);
        assert_eq!(row_offsets(1000, 1).collect::<Vec<_>>(), vec![1000]);
        assert_eq!(row_offsets(1000, 0).count(), 0);
    }

    #[test]
    fn test_config_debug_redacts_password() {
        let config = MySqlSourceConfig::new("db", "repl")
            .with_password("s3cret")
            .with_server_id(42);
        let debug = format!("{config:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("42"));
    }

    #[test]
    fn test_pool_accepts_special_characters() {
        let config = MySqlSourceConfig::new("localhost", "user@corp").with_password("p@ss:w/rd");
        assert!(config.pool().is_ok());
    }

    #[tokio::test]
    #[ignore = "requires a MySQL server with binlog_format=ROW"]
    async fn test_current_position_live() {
        let config = MySqlSourceConfig::new("127.0.0.1", "root")
            .with_password(std::env::var("MYSQL_PASSWD").unwrap_or_default());
        let source = MySqlBinlogSource::new(config).unwrap();
        let pos = source.current_position().await.unwrap();
        assert!(pos.offset >= BINLOG_START_OFFSET);
        source.disconnect().await.unwrap();
    }
}
