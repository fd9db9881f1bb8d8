//! Watermarks kept in an Iceberg table
//!
//! Records live in `cdc_metadata.watermarks` with the shared watermark
//! layout; `connection_name`, `server_id`, `schema` and `table` are the
//! table's identifier fields.
//!
//! Each upsert commits the full record as one fast-append snapshot, so a
//! record is either entirely visible or not at all. Older records for the
//! same key stay in earlier data files; a read returns the most recently
//! written one (latest `updated_at`, then the furthest position).

use super::{commit_append, ensure_namespace, iceberg_error, write_data_files, Compression, IcebergCatalog};
use crate::common::{CdcError, LogPosition, Result, Watermark, WatermarkKey, WatermarkStore};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Int64Array, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use async_trait::async_trait;
use chrono::DateTime;
use futures::TryStreamExt;
use iceberg::arrow::schema_to_arrow_schema;
use iceberg::expr::Reference;
use iceberg::spec::{Datum, NestedField, PrimitiveType, Schema as IcebergSchema, Type};
use iceberg::table::Table;
use iceberg::{NamespaceIdent, TableCreation, TableIdent};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Namespace of the watermark table.
pub const WATERMARK_NAMESPACE: &str = "cdc_metadata";
/// Name of the watermark table.
pub const WATERMARK_TABLE: &str = "watermarks";

/// Iceberg schema of the watermark table.
pub fn watermark_table_schema() -> Result<IcebergSchema> {
    let string = || Type::Primitive(PrimitiveType::String);
    let long = || Type::Primitive(PrimitiveType::Long);

    IcebergSchema::builder()
        .with_fields(vec![
            NestedField::required(1, "connection_name", string()).into(),
            NestedField::required(2, "server_id", long()).into(),
            NestedField::required(3, "schema", string()).into(),
            NestedField::required(4, "table", string()).into(),
            NestedField::optional(5, "log_file", string()).into(),
            NestedField::optional(6, "log_position", long()).into(),
            NestedField::optional(7, "backfill_complete", Type::Primitive(PrimitiveType::Boolean)).into(),
            NestedField::optional(8, "updated_at", Type::Primitive(PrimitiveType::Timestamp)).into(),
        ])
        .with_identifier_field_ids(vec![1, 2, 3, 4])
        .build()
        .map_err(|e| iceberg_error("invalid watermark table schema", e))
}

/// Watermark store on the injected Iceberg catalog.
pub struct IcebergWatermarkStore {
    catalog: Arc<IcebergCatalog>,
    table: Mutex<Option<Table>>,
}

impl std::fmt::Debug for IcebergWatermarkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IcebergWatermarkStore")
            .field("catalog", &self.catalog)
            .finish()
    }
}

impl IcebergWatermarkStore {
    pub fn new(catalog: Arc<IcebergCatalog>) -> Self {
        Self {
            catalog,
            table: Mutex::new(None),
        }
    }

    fn idents() -> (NamespaceIdent, TableIdent) {
        let namespace = NamespaceIdent::new(WATERMARK_NAMESPACE.to_string());
        let table = TableIdent::new(namespace.clone(), WATERMARK_TABLE.to_string());
        (namespace, table)
    }

    async fn load_or_create(&self) -> Result<Table> {
        let catalog = self.catalog.as_catalog();
        let (namespace, ident) = Self::idents();
        ensure_namespace(catalog, &namespace).await?;

        let exists = catalog
            .table_exists(&ident)
            .await
            .map_err(|e| iceberg_error("failed to check watermark table", e))?;
        if exists {
            return catalog
                .load_table(&ident)
                .await
                .map_err(|e| iceberg_error("failed to load watermark table", e));
        }

        info!(namespace = WATERMARK_NAMESPACE, table = WATERMARK_TABLE, "Creating watermark table");
        let creation = TableCreation::builder()
            .name(WATERMARK_TABLE.to_string())
            .schema(watermark_table_schema()?)
            .build();
        catalog
            .create_table(&namespace, creation)
            .await
            .map_err(|e| iceberg_error("failed to create watermark table", e))
    }
}

/// One-row Arrow batch holding `watermark`.
fn watermark_to_record_batch(watermark: &Watermark, schema: &IcebergSchema) -> Result<RecordBatch> {
    let arrow_schema = schema_to_arrow_schema(schema)
        .map_err(|e| iceberg_error("failed to convert schema to Arrow", e))?;
    let key = &watermark.key;

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(vec![key.connection_name.as_str()])),
        Arc::new(Int64Array::from(vec![key.server_id as i64])),
        Arc::new(StringArray::from(vec![key.schema.as_str()])),
        Arc::new(StringArray::from(vec![key.table.as_str()])),
        Arc::new(StringArray::from(vec![watermark.position.file.as_str()])),
        Arc::new(Int64Array::from(vec![watermark.position.offset as i64])),
        Arc::new(BooleanArray::from(vec![watermark.backfill_complete])),
        // Timestamp without zone: UTC wall clock
        Arc::new(TimestampMicrosecondArray::from(vec![watermark.updated_at.timestamp_micros()])),
    ];
    RecordBatch::try_new(Arc::new(arrow_schema), columns)
        .map_err(|e| CdcError::serialization(format!("failed to build watermark batch: {e}")))
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| CdcError::serialization(format!("watermark table column '{name}' missing or mistyped")))
}

/// Decode the records of `key` found in `batch`.
fn records_for_key(batch: &RecordBatch, key: &WatermarkKey) -> Result<Vec<Watermark>> {
    let connections = column::<StringArray>(batch, "connection_name")?;
    let server_ids = column::<Int64Array>(batch, "server_id")?;
    let schemas = column::<StringArray>(batch, "schema")?;
    let tables = column::<StringArray>(batch, "table")?;
    let files = column::<StringArray>(batch, "log_file")?;
    let offsets = column::<Int64Array>(batch, "log_position")?;
    let flags = column::<BooleanArray>(batch, "backfill_complete")?;
    let updated = column::<TimestampMicrosecondArray>(batch, "updated_at")?;

    let mut records = Vec::new();
    for i in 0..batch.num_rows() {
        let matches = connections.value(i) == key.connection_name
            && server_ids.value(i) == key.server_id as i64
            && schemas.value(i) == key.schema
            && tables.value(i) == key.table;
        if !matches {
            continue;
        }
        if files.is_null(i) || offsets.is_null(i) || updated.is_null(i) {
            return Err(CdcError::serialization(format!("incomplete watermark record for {key}")));
        }
        let updated_at = DateTime::from_timestamp_micros(updated.value(i))
            .ok_or_else(|| CdcError::serialization(format!("invalid updated_at for {key}")))?;
        records.push(Watermark {
            key: key.clone(),
            position: LogPosition::new(files.value(i), offsets.value(i).max(0) as u64),
            backfill_complete: !flags.is_null(i) && flags.value(i),
            updated_at,
        });
    }
    Ok(records)
}

/// Most recently written record.
fn latest(records: Vec<Watermark>) -> Option<Watermark> {
    records.into_iter().max_by(|a, b| {
        a.updated_at
            .cmp(&b.updated_at)
            .then_with(|| a.position.cmp(&b.position))
            .then_with(|| a.backfill_complete.cmp(&b.backfill_complete))
    })
}

#[async_trait]
impl WatermarkStore for IcebergWatermarkStore {
    async fn read(&self, key: &WatermarkKey) -> Result<Option<Watermark>> {
        // Reload so records committed by other writers are visible
        let table = self.load_or_create().await?;
        if table.metadata().current_snapshot().is_none() {
            return Ok(None);
        }

        let filter = Reference::new("connection_name")
            .equal_to(Datum::string(&key.connection_name))
            .and(Reference::new("server_id").equal_to(Datum::long(key.server_id as i64)))
            .and(Reference::new("schema").equal_to(Datum::string(&key.schema)))
            .and(Reference::new("table").equal_to(Datum::string(&key.table)));
        let scan = table
            .scan()
            .with_filter(filter)
            .build()
            .map_err(|e| iceberg_error("failed to plan watermark scan", e))?;
        let batches: Vec<RecordBatch> = scan
            .to_arrow()
            .await
            .map_err(|e| iceberg_error("failed to scan watermark table", e))?
            .try_collect()
            .await
            .map_err(|e| iceberg_error("failed to read watermark table", e))?;

        let mut records = Vec::new();
        for batch in &batches {
            records.extend(records_for_key(batch, key)?);
        }
        debug!(key = %key, records = records.len(), "Scanned watermark records");

        *self.table.lock().await = Some(table);
        Ok(latest(records))
    }

    async fn upsert(&self, watermark: &Watermark) -> Result<()> {
        watermark.key.validate()?;

        let mut cached = self.table.lock().await;
        let table = match cached.take() {
            Some(table) => table,
            None => self.load_or_create().await?,
        };

        let batch = watermark_to_record_batch(watermark, table.metadata().current_schema())?;
        let files = write_data_files(&table, batch, None, Compression::default()).await?;
        let updated = commit_append(&self.catalog, &table, files).await?;
        *cached = Some(updated);

        debug!(key = %watermark.key, position = %watermark.position, "Saved watermark");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "iceberg"
    }
}
