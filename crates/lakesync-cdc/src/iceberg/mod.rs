//! Apache Iceberg table writer
//!
//! Appends each [`Batch`] as Parquet data files committed in one
//! fast-append transaction, so a batch becomes visible as exactly one new
//! snapshot.
//!
//! The catalog is built explicitly and injected:
//!
//! ```rust,ignore
//! let catalog = Arc::new(IcebergCatalog::rest("http://localhost:8181", Some("s3://lake")).await?);
//! let writer = IcebergTableWriter::new(catalog, "shop", "orders");
//! writer.ensure_table().await?;
//! ```
//!
//! Namespace and table are created on first use with the row layout
//! of [`TableRow`], partitioned by day of the capture `timestamp`. Rows of
//! one batch that span several days go to one data file group per day, all
//! in the same commit.
//!
//! [`IcebergWatermarkStore`] keeps watermarks in `cdc_metadata.watermarks`
//! on the same catalog.

mod watermark;

pub use watermark::IcebergWatermarkStore;

use crate::common::{Batch, CdcError, Result, TableRow, TableVersion, TableWriter};
use arrow_array::{ArrayRef, Int64Array, RecordBatch, StringArray, TimestampMicrosecondArray};
use async_trait::async_trait;
use iceberg::arrow::schema_to_arrow_schema;
use iceberg::spec::{
    DataFile, DataFileFormat, Literal, NestedField, PartitionKey, PrimitiveType, Schema as IcebergSchema,
    Struct, Transform, Type, UnboundPartitionSpec,
};
use iceberg::table::Table;
use iceberg::transaction::{ApplyTransactionAction, Transaction};
use iceberg::writer::base_writer::data_file_writer::DataFileWriterBuilder;
use iceberg::writer::file_writer::location_generator::{
    DefaultFileNameGenerator, DefaultLocationGenerator,
};
use iceberg::writer::file_writer::rolling_writer::RollingFileWriterBuilder;
use iceberg::writer::file_writer::ParquetWriterBuilder;
use iceberg::writer::{IcebergWriter, IcebergWriterBuilder};
use iceberg::{Catalog, CatalogBuilder, NamespaceIdent, TableCreation, TableIdent};
use iceberg_catalog_rest::{RestCatalogBuilder, REST_CATALOG_PROP_URI, REST_CATALOG_PROP_WAREHOUSE};
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default warehouse for the in-memory catalog.
pub const DEFAULT_MEMORY_WAREHOUSE: &str = "file:///tmp/lakesync-warehouse";

fn iceberg_error(context: &str, e: iceberg::Error) -> CdcError {
    if e.retryable() {
        CdcError::write(format!("{context}: {e}"))
    } else {
        CdcError::iceberg(format!("{context}: {:?}: {e}", e.kind()))
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// REST or in-memory Iceberg catalog.
#[allow(clippy::large_enum_variant)]
pub enum IcebergCatalog {
    Rest(Box<iceberg_catalog_rest::RestCatalog>),
    Memory(iceberg::MemoryCatalog),
}

impl std::fmt::Debug for IcebergCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rest(_) => f.write_str("IcebergCatalog::Rest"),
            Self::Memory(_) => f.write_str("IcebergCatalog::Memory"),
        }
    }
}

impl IcebergCatalog {
    /// Connect to a REST catalog.
    pub async fn rest(uri: &str, warehouse: Option<&str>) -> Result<Self> {
        let mut props = HashMap::new();
        props.insert(REST_CATALOG_PROP_URI.to_string(), uri.to_string());
        if let Some(warehouse) = warehouse {
            props.insert(REST_CATALOG_PROP_WAREHOUSE.to_string(), warehouse.to_string());
        }

        let catalog = RestCatalogBuilder::default()
            .load("lakesync", props)
            .await
            .map_err(|e| CdcError::connection(format!("failed to create REST catalog: {e}")))?;
        info!(uri, "Created REST catalog");
        Ok(Self::Rest(Box::new(catalog)))
    }

    /// In-process catalog writing to `warehouse`.
    pub async fn memory(warehouse: Option<&str>) -> Result<Self> {
        use iceberg::memory::{MemoryCatalogBuilder, MEMORY_CATALOG_WAREHOUSE};

        let warehouse = warehouse.unwrap_or(DEFAULT_MEMORY_WAREHOUSE);
        let mut props = HashMap::new();
        props.insert(MEMORY_CATALOG_WAREHOUSE.to_string(), warehouse.to_string());

        let catalog = MemoryCatalogBuilder::default()
            .load("memory", props)
            .await
            .map_err(|e| CdcError::config(format!("failed to create memory catalog: {e}")))?;
        info!(warehouse, "Created memory catalog");
        Ok(Self::Memory(catalog))
    }

    fn as_catalog(&self) -> &dyn Catalog {
        match self {
            Self::Rest(c) => c.as_ref(),
            Self::Memory(c) => c,
        }
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Parquet compression codec for data files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Snappy,
    Zstd,
    Gzip,
}

impl Compression {
    fn to_parquet(self) -> parquet::basic::Compression {
        match self {
            Self::None => parquet::basic::Compression::UNCOMPRESSED,
            Self::Snappy => parquet::basic::Compression::SNAPPY,
            Self::Zstd => parquet::basic::Compression::ZSTD(Default::default()),
            Self::Gzip => parquet::basic::Compression::GZIP(Default::default()),
        }
    }
}

/// Iceberg schema of the change table.
pub fn change_table_schema() -> Result<IcebergSchema> {
    let string = || Type::Primitive(PrimitiveType::String);
    let long = || Type::Primitive(PrimitiveType::Long);

    IcebergSchema::builder()
        .with_fields(vec![
            NestedField::required(1, "event_type", string()).into(),
            NestedField::required(2, "timestamp", Type::Primitive(PrimitiveType::Timestamptz)).into(),
            NestedField::required(3, "log_file", string()).into(),
            NestedField::required(4, "log_position", long()).into(),
            NestedField::required(5, "payload", string()).into(),
            NestedField::optional(6, "before_payload", string()).into(),
            NestedField::required(7, "server_id", long()).into(),
        ])
        .build()
        .map_err(|e| iceberg_error("invalid change table schema", e))
}

/// Partition name of the day transform on `timestamp`.
pub const DAY_PARTITION: &str = "date";

/// Rolling size of Parquet data files.
const TARGET_FILE_SIZE: usize = 128 * 1024 * 1024;

const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Day partitioning of the change table on `timestamp` (field 2).
pub fn change_table_partition_spec() -> Result<UnboundPartitionSpec> {
    Ok(UnboundPartitionSpec::builder()
        .add_partition_field(2, DAY_PARTITION, Transform::Day)
        .map_err(|e| iceberg_error("invalid change table partition spec", e))?
        .build())
}

/// Days since the Unix epoch, the value of the day transform.
fn epoch_day(row: &TableRow) -> i32 {
    row.timestamp.timestamp_micros().div_euclid(MICROS_PER_DAY) as i32
}

/// Split rows by capture day, keeping their order inside each day.
fn rows_by_day(rows: Vec<TableRow>) -> BTreeMap<i32, Vec<TableRow>> {
    let mut days: BTreeMap<i32, Vec<TableRow>> = BTreeMap::new();
    for row in rows {
        days.entry(epoch_day(&row)).or_default().push(row);
    }
    days
}

/// Encode rows as an Arrow batch matching `schema` (field ids included).
pub fn rows_to_record_batch(rows: &[TableRow], schema: &IcebergSchema) -> Result<RecordBatch> {
    let arrow_schema = schema_to_arrow_schema(schema)
        .map_err(|e| iceberg_error("failed to convert schema to Arrow", e))?;

    let event_types: ArrayRef = Arc::new(StringArray::from_iter_values(
        rows.iter().map(|r| r.event_type.as_str()),
    ));
    // Timestamptz maps to microseconds with a UTC zone
    let timestamps: ArrayRef = Arc::new(
        TimestampMicrosecondArray::from_iter_values(rows.iter().map(|r| r.timestamp.timestamp_micros()))
            .with_timezone("+00:00"),
    );
    let files: ArrayRef = Arc::new(StringArray::from_iter_values(
        rows.iter().map(|r| r.log_file.as_str()),
    ));
    let positions: ArrayRef = Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.log_position)));
    let payloads: ArrayRef = Arc::new(StringArray::from_iter_values(
        rows.iter().map(|r| r.payload.as_str()),
    ));
    let before: ArrayRef = Arc::new(StringArray::from_iter(
        rows.iter().map(|r| r.before_payload.as_deref()),
    ));
    let server_ids: ArrayRef = Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.server_id)));

    RecordBatch::try_new(
        Arc::new(arrow_schema),
        vec![event_types, timestamps, files, positions, payloads, before, server_ids],
    )
    .map_err(|e| CdcError::serialization(format!("failed to build record batch: {e}")))
}

/// Writes change events to one Iceberg table.
///
/// Appends are serialized; the loaded table is replaced by the one returned
/// from each commit so the next append starts from fresh metadata.
pub struct IcebergTableWriter {
    catalog: Arc<IcebergCatalog>,
    namespace: String,
    table_name: String,
    compression: Compression,
    table: Mutex<Option<Table>>,
}

impl std::fmt::Debug for IcebergTableWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IcebergTableWriter")
            .field("catalog", &self.catalog)
            .field("namespace", &self.namespace)
            .field("table", &self.table_name)
            .finish()
    }
}

impl IcebergTableWriter {
    pub fn new(
        catalog: Arc<IcebergCatalog>,
        namespace: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            namespace: namespace.into(),
            table_name: table.into(),
            compression: Compression::default(),
            table: Mutex::new(None),
        }
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    fn idents(&self) -> Result<(NamespaceIdent, TableIdent)> {
        let namespace = NamespaceIdent::from_strs([&self.namespace])
            .map_err(|e| CdcError::config(format!("invalid namespace {}: {e}", self.namespace)))?;
        let table = TableIdent::new(namespace.clone(), self.table_name.clone());
        Ok((namespace, table))
    }

    /// Load the table, creating namespace and table if they are missing.
    async fn load_or_create(&self) -> Result<Table> {
        let catalog = self.catalog.as_catalog();
        let (namespace, ident) = self.idents()?;

        ensure_namespace(catalog, &namespace).await?;

        let exists = catalog
            .table_exists(&ident)
            .await
            .map_err(|e| iceberg_error("failed to check table", e))?;
        if exists {
            debug!(namespace = %self.namespace, table = %self.table_name, "Loading table");
            return catalog
                .load_table(&ident)
                .await
                .map_err(|e| iceberg_error("failed to load table", e));
        }

        info!(namespace = %self.namespace, table = %self.table_name, "Creating change table");
        let creation = TableCreation::builder()
            .name(self.table_name.clone())
            .schema(change_table_schema()?)
            .partition_spec(change_table_partition_spec()?)
            .build();
        catalog
            .create_table(&namespace, creation)
            .await
            .map_err(|e| iceberg_error("failed to create table", e))
    }

    /// Write rows as data files, one group per day partition.
    async fn write_rows(&self, table: &Table, rows: Vec<TableRow>) -> Result<Vec<DataFile>> {
        let metadata = table.metadata();
        let spec = metadata.default_partition_spec();
        let schema = metadata.current_schema();

        if spec.is_unpartitioned() {
            let record_batch = rows_to_record_batch(&rows, schema)?;
            return write_data_files(table, record_batch, None, self.compression).await;
        }

        let mut files = Vec::new();
        for (day, rows) in rows_by_day(rows) {
            let record_batch = rows_to_record_batch(&rows, schema)?;
            let key = PartitionKey::new(
                spec.as_ref().clone(),
                schema.clone(),
                Struct::from_iter([Some(Literal::date(day))]),
            );
            debug!(table = %self.table_name, day, rows = rows.len(), "Writing day partition");
            files.extend(write_data_files(table, record_batch, Some(key), self.compression).await?);
        }
        Ok(files)
    }
}

/// Write one Arrow batch as Parquet data files of `table`.
async fn write_data_files(
    table: &Table,
    batch: RecordBatch,
    partition: Option<PartitionKey>,
    compression: Compression,
) -> Result<Vec<DataFile>> {
    let location_generator = DefaultLocationGenerator::new(table.metadata().clone())
        .map_err(|e| iceberg_error("failed to create location generator", e))?;
    // Unique prefix per write so no file name is ever reused
    let file_name_generator = DefaultFileNameGenerator::new(
        "lakesync".to_string(),
        Some(uuid::Uuid::new_v4().simple().to_string()),
        DataFileFormat::Parquet,
    );
    let props = WriterProperties::builder()
        .set_compression(compression.to_parquet())
        .build();

    let parquet = ParquetWriterBuilder::new(props, table.metadata().current_schema().clone());
    let rolling = RollingFileWriterBuilder::new(
        parquet,
        TARGET_FILE_SIZE,
        table.file_io().clone(),
        location_generator,
        file_name_generator,
    );

    let mut writer = DataFileWriterBuilder::new(rolling)
        .build(partition)
        .await
        .map_err(|e| iceberg_error("failed to create data file writer", e))?;
    writer
        .write(batch)
        .await
        .map_err(|e| iceberg_error("failed to write record batch", e))?;
    writer
        .close()
        .await
        .map_err(|e| iceberg_error("failed to close data file writer", e))
}

/// Commit data files as one fast-append snapshot, returning the new table.
async fn commit_append(catalog: &IcebergCatalog, table: &Table, data_files: Vec<DataFile>) -> Result<Table> {
    let tx = Transaction::new(table);
    let tx = tx
        .fast_append()
        .add_data_files(data_files)
        .apply(tx)
        .map_err(|e| iceberg_error("failed to apply fast append", e))?;
    tx.commit(catalog.as_catalog())
        .await
        .map_err(|e| iceberg_error("failed to commit append", e))
}

/// Create the namespace if it does not exist yet.
async fn ensure_namespace(catalog: &dyn Catalog, namespace: &NamespaceIdent) -> Result<()> {
    let exists = catalog
        .namespace_exists(namespace)
        .await
        .map_err(|e| iceberg_error("failed to check namespace", e))?;
    if !exists {
        info!(namespace = %namespace.to_url_string(), "Creating namespace");
        catalog
            .create_namespace(namespace, HashMap::new())
            .await
            .map_err(|e| iceberg_error("failed to create namespace", e))?;
    }
    Ok(())
}

fn snapshot_count(table: &Table) -> TableVersion {
    table.metadata().snapshots().count() as TableVersion
}

#[async_trait]
impl TableWriter for IcebergTableWriter {
    async fn ensure_table(&self) -> Result<()> {
        let mut cached = self.table.lock().await;
        if cached.is_none() {
            *cached = Some(self.load_or_create().await?);
        }
        Ok(())
    }

    async fn append(&self, batch: &Batch) -> Result<TableVersion> {
        if batch.is_empty() {
            return Err(CdcError::invalid_state("refusing to append an empty batch"));
        }
        let rows = TableRow::encode_batch(batch)?;

        let mut cached = self.table.lock().await;
        let table = match cached.take() {
            Some(table) => table,
            None => self.load_or_create().await?,
        };

        // A failed write or commit leaves the cache empty so the retry
        // reloads current metadata.
        let data_files = self.write_rows(&table, rows).await?;
        if data_files.is_empty() {
            warn!(table = %self.table_name, "Write produced no data files");
            return Err(CdcError::write("no data files produced"));
        }
        let file_count = data_files.len();

        let updated = commit_append(&self.catalog, &table, data_files).await?;

        let version = snapshot_count(&updated);
        info!(
            namespace = %self.namespace,
            table = %self.table_name,
            rows = batch.len(),
            files = file_count,
            version,
            "Committed Iceberg append"
        );
        *cached = Some(updated);
        Ok(version)
    }

    async fn current_version(&self) -> Result<TableVersion> {
        let (_, ident) = self.idents()?;
        let table = self
            .catalog
            .as_catalog()
            .load_table(&ident)
            .await
            .map_err(|e| iceberg_error("failed to load table", e))?;
        Ok(snapshot_count(&table))
    }

    fn name(&self) -> &'static str {
        "iceberg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BatchAccumulator, BatchConfig, ChangeEvent, LogPosition, RowImage};
    use arrow_array::Array;
    use chrono::{DateTime, Duration, Utc};

    async fn memory_catalog(dir: &tempfile::TempDir) -> Arc<IcebergCatalog> {
        let warehouse = format!("file://{}", dir.path().display());
        Arc::new(IcebergCatalog::memory(Some(&warehouse)).await.unwrap())
    }

    fn row_at(timestamp: &str) -> TableRow {
        TableRow {
            event_type: "insert".into(),
            timestamp: DateTime::parse_from_rfc3339(timestamp).unwrap().with_timezone(&Utc),
            log_file: "mysql-bin.000001".into(),
            log_position: 4,
            payload: "{}".into(),
            before_payload: None,
            server_id: 1,
        }
    }

    fn batch(offsets: &[u64]) -> Batch {
        let mut acc = BatchAccumulator::new(BatchConfig::builder().max_events(100).build());
        for &offset in offsets {
            acc.push(
                ChangeEvent::insert(
                    "shop",
                    "orders",
                    RowImage::new().with("id", offset as i64),
                    LogPosition::new("mysql-bin.000001", offset),
                )
                .with_server_id(1),
            );
        }
        acc.flush().unwrap()
    }

    #[test]
    fn test_schema_layout() {
        let schema = change_table_schema().unwrap();
        let names: Vec<_> = schema.as_struct().fields().iter().map(|f| f.name.clone()).collect();
        assert_eq!(
            names,
            ["event_type", "timestamp", "log_file", "log_position", "payload", "before_payload", "server_id"]
        );
        assert!(!schema.as_struct().fields()[5].required);
    }

    #[test]
    fn test_record_batch_columns() {
        let schema = change_table_schema().unwrap();
        let rows = vec![TableRow {
            event_type: "update".into(),
            timestamp: Utc::now(),
            log_file: "mysql-bin.000002".into(),
            log_position: 4711,
            payload: r#"{"id":1}"#.into(),
            before_payload: Some(r#"{"id":0}"#.into()),
            server_id: 7,
        }];
        let rb = rows_to_record_batch(&rows, &schema).unwrap();
        assert_eq!(rb.num_rows(), 1);
        assert_eq!(rb.num_columns(), 7);
        let positions = rb.column(3).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(positions.value(0), 4711);
    }

    #[test]
    fn test_rows_split_by_utc_day() {
        let rows = vec![
            row_at("2024-05-01T23:59:59Z"),
            row_at("2024-05-02T00:00:00Z"),
            row_at("2024-05-01T00:00:00Z"),
            row_at("1969-12-31T12:00:00Z"),
        ];
        let days = rows_by_day(rows);
        let keys: Vec<_> = days.keys().copied().collect();
        // 2024-05-01 is day 19844 since the epoch
        assert_eq!(keys, [-1, 19844, 19845]);
        assert_eq!(days[&19844].len(), 2);
        assert_eq!(days[&19844][0].timestamp.to_rfc3339(), "2024-05-01T23:59:59+00:00");
    }

    #[tokio::test]
    async fn test_change_table_partitioned_by_day() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = memory_catalog(&dir).await;
        let writer = IcebergTableWriter::new(catalog.clone(), "shop", "orders");
        writer.ensure_table().await.unwrap();

        let (_, ident) = writer.idents().unwrap();
        let table = catalog.as_catalog().load_table(&ident).await.unwrap();
        let spec = table.metadata().default_partition_spec();
        assert_eq!(spec.fields().len(), 1);
        let field = &spec.fields()[0];
        assert_eq!(field.name, DAY_PARTITION);
        assert_eq!(field.source_id, 2);
        assert_eq!(field.transform, Transform::Day);
    }

    #[tokio::test]
    async fn test_batch_spanning_midnight_is_one_commit() {
        let dir = tempfile::tempdir().unwrap();
        let writer = IcebergTableWriter::new(memory_catalog(&dir).await, "shop", "orders");

        let mut batch = batch(&[10, 11]);
        batch.events[0].captured_at = Utc::now() - Duration::days(1);
        assert_eq!(writer.append(&batch).await.unwrap(), 1);
        assert_eq!(writer.current_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_catalog_append_bumps_version() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = memory_catalog(&dir).await;
        let writer = IcebergTableWriter::new(catalog, "shop", "orders");

        writer.ensure_table().await.unwrap();
        assert_eq!(writer.current_version().await.unwrap(), 0);

        assert_eq!(writer.append(&batch(&[10, 11])).await.unwrap(), 1);
        assert_eq!(writer.append(&batch(&[12])).await.unwrap(), 2);
        assert_eq!(writer.current_version().await.unwrap(), 2);
    }
}
