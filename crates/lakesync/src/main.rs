//! lakesync - MySQL change data capture into lakehouse tables
//!
//! Runs one pipeline for one source table: a full backfill (`mode: backfill`)
//! or continuous binlog streaming (`mode: cdc`) with a durable watermark.
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │    MySQL    │────▶│   Pipeline   │────▶│ Table (file/ │
//! │   binlog    │     │  (batching)  │     │   iceberg)   │
//! └─────────────┘     └──────┬───────┘     └──────────────┘
//!                            │ after each append
//!                            ▼
//!                     ┌──────────────┐
//!                     │  Watermarks  │
//!                     │ (file/pg/ice)│
//!                     └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! # Stream changes (configuration from the environment)
//! CDC_SCHEMA=shop CDC_TABLE=orders CONNECTION_NAME=orders-sync lakesync run
//!
//! # With a config file
//! lakesync -c lakesync.yaml run
//!
//! # Inspect the stored watermark
//! lakesync -c lakesync.yaml watermark show
//!
//! # Validate configuration
//! lakesync -c lakesync.yaml validate
//! ```

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::{LakesyncConfig, TableStoreKind, WatermarkStoreKind};
use lakesync_cdc::common::{Pipeline, PipelineOutcome, SharedTableWriter, SharedWatermarkStore};
use lakesync_cdc::{FileTableWriter, FileWatermarkStore, WatermarkStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "lakesync")]
#[command(version, about = "Replicate MySQL table changes into lakehouse tables")]
struct Cli {
    /// Path to configuration file (environment variables override it)
    #[arg(short, long, env = "LAKESYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "LAKESYNC_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default)
    Run {
        /// Stop once the source's current position is committed
        #[arg(long)]
        until_caught_up: bool,
        /// Allow Iceberg stores without a catalog URI, on an in-memory catalog
        #[arg(long)]
        dry_run: bool,
    },
    /// Inspect watermarks
    Watermark {
        #[command(subcommand)]
        command: WatermarkCommands,
    },
    /// Validate configuration
    Validate,
}

#[derive(Subcommand)]
enum WatermarkCommands {
    /// Print the stored watermark of the configured table
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let config = LakesyncConfig::load(cli.config.as_deref()).with_context(|| match &cli.config {
        Some(path) => format!("Failed to load config from {}", path.display()),
        None => "Failed to load config from environment".to_string(),
    })?;

    let default_command = Commands::Run {
        until_caught_up: false,
        dry_run: false,
    };
    match cli.command.unwrap_or(default_command) {
        Commands::Run {
            until_caught_up,
            dry_run,
        } => {
            let mut config = config;
            config.until_caught_up |= until_caught_up;
            config.dry_run |= dry_run;
            run(config).await
        }
        Commands::Watermark {
            command: WatermarkCommands::Show,
        } => show_watermark(config).await,
        Commands::Validate => validate_config(config),
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (text, json) = match format {
        LogFormat::Text => (Some(tracing_subscriber::fmt::layer().with_target(true)), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
}

async fn run(config: LakesyncConfig) -> Result<()> {
    config.validate()?;
    info!(
        connection = %config.connection_name,
        table = %format!("{}.{}", config.source.schema, config.source.table),
        mode = %config.mode,
        "Starting lakesync"
    );

    let catalog = build_catalog(&config).await?;
    let watermarks = build_watermark_store(&config, catalog.as_ref()).await?;
    let writer = build_table_writer(&config, catalog.as_ref()).await?;
    let pipeline = build_pipeline(&config, writer, watermarks)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(4);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(());
    });

    let result = pipeline.run(shutdown_rx).await;
    let stats = pipeline.stats().snapshot();
    info!(
        events_read = stats.events_read,
        events_committed = stats.events_committed,
        batches = stats.batches_committed,
        retries = stats.retries,
        reconnects = stats.reconnects,
        "Pipeline statistics"
    );

    match result.context("Pipeline failed")? {
        PipelineOutcome::Backfilled(report) => info!(
            rows = report.rows,
            batches = report.batches,
            position = %report.reference_position,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Backfill complete"
        ),
        PipelineOutcome::AlreadyBackfilled(watermark) => {
            info!(watermark = %watermark, "Backfill was already complete")
        }
        PipelineOutcome::Stopped { watermark } | PipelineOutcome::CaughtUp { watermark } => {
            match watermark {
                Some(w) => info!(watermark = %w, "Stopped"),
                None => info!("Stopped before the first commit"),
            }
        }
    }
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received shutdown signal (SIGINT)"),
                    _ = term.recv() => info!("Received shutdown signal (SIGTERM)"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, only SIGINT stops the service");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received shutdown signal (SIGINT)");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
    }
}

#[cfg(feature = "iceberg")]
type SharedCatalog = Arc<lakesync_cdc::iceberg::IcebergCatalog>;
#[cfg(not(feature = "iceberg"))]
type SharedCatalog = ();

/// One catalog for every Iceberg store of this run.
#[cfg(feature = "iceberg")]
async fn build_catalog(config: &LakesyncConfig) -> Result<Option<SharedCatalog>> {
    use lakesync_cdc::iceberg::IcebergCatalog;

    if !config.uses_iceberg() {
        return Ok(None);
    }
    let warehouse = config.table_store.warehouse.as_deref();
    let catalog = match config.table_store.catalog_uri.as_deref() {
        Some(uri) => IcebergCatalog::rest(uri, warehouse)
            .await
            .context("Failed to connect to the Iceberg catalog")?,
        None if config.dry_run => {
            warn!("Dry run without ICEBERG_CATALOG_URI, using an in-memory catalog");
            IcebergCatalog::memory(warehouse).await?
        }
        None => anyhow::bail!("table_store.catalog_uri is required for Iceberg stores (ICEBERG_CATALOG_URI)"),
    };
    Ok(Some(Arc::new(catalog)))
}

#[cfg(not(feature = "iceberg"))]
async fn build_catalog(_config: &LakesyncConfig) -> Result<Option<SharedCatalog>> {
    Ok(None)
}

#[cfg_attr(not(feature = "iceberg"), allow(unused_variables))]
async fn build_watermark_store(
    config: &LakesyncConfig,
    catalog: Option<&SharedCatalog>,
) -> Result<SharedWatermarkStore> {
    match config.watermark_store.kind {
        WatermarkStoreKind::File => {
            let dir = config.watermark_dir();
            let store = FileWatermarkStore::new(&dir)
                .await
                .with_context(|| format!("Failed to open watermark directory {}", dir.display()))?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "postgres")]
        WatermarkStoreKind::Postgres => {
            let url = config
                .watermark_store
                .postgres_url
                .as_deref()
                .context("watermark_store.postgres_url is not set")?;
            let store = lakesync_cdc::postgres::PostgresWatermarkStore::connect(url)
                .await
                .context("Failed to connect to the watermark database")?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        WatermarkStoreKind::Postgres => anyhow::bail!("watermark store 'postgres' requires the 'postgres' feature"),
        #[cfg(feature = "iceberg")]
        WatermarkStoreKind::Iceberg => {
            let catalog = catalog.context("no Iceberg catalog configured")?;
            Ok(Arc::new(lakesync_cdc::iceberg::IcebergWatermarkStore::new(catalog.clone())))
        }
        #[cfg(not(feature = "iceberg"))]
        WatermarkStoreKind::Iceberg => anyhow::bail!("watermark store 'iceberg' requires the 'iceberg' feature"),
    }
}

#[cfg_attr(not(feature = "iceberg"), allow(unused_variables))]
async fn build_table_writer(
    config: &LakesyncConfig,
    catalog: Option<&SharedCatalog>,
) -> Result<SharedTableWriter> {
    let (schema, table) = (&config.source.schema, &config.source.table);
    match config.table_store.kind {
        TableStoreKind::File => {
            let writer = FileTableWriter::new(&config.table_store.data_dir, schema, table)?;
            Ok(Arc::new(writer))
        }
        #[cfg(feature = "iceberg")]
        TableStoreKind::Iceberg => {
            use lakesync_cdc::iceberg::IcebergTableWriter;

            let catalog = catalog.context("no Iceberg catalog configured")?;
            Ok(Arc::new(IcebergTableWriter::new(catalog.clone(), schema, table)))
        }
        #[cfg(not(feature = "iceberg"))]
        TableStoreKind::Iceberg => anyhow::bail!("table store 'iceberg' requires the 'iceberg' feature"),
    }
}

#[cfg(feature = "mysql")]
fn build_pipeline(
    config: &LakesyncConfig,
    writer: SharedTableWriter,
    watermarks: SharedWatermarkStore,
) -> Result<Pipeline> {
    use lakesync_cdc::common::PipelineMode;
    use lakesync_cdc::mysql::{MySqlBinlogSource, MySqlSnapshotSource, MySqlSourceConfig};

    let mut source = MySqlSourceConfig::new(&config.source.host, &config.source.user)
        .with_port(config.source.port)
        .with_server_id(config.source.server_id);
    if let Some(password) = &config.source.password {
        source = source.with_password(password);
    }

    let builder = Pipeline::builder(config.pipeline_config())
        .writer(writer)
        .watermark_store(watermarks);
    let builder = match config.mode {
        PipelineMode::Cdc => builder.change_source(Arc::new(MySqlBinlogSource::new(source)?)),
        PipelineMode::Backfill => builder.snapshot_source(Arc::new(MySqlSnapshotSource::new(&source)?)),
    };
    Ok(builder.build()?)
}

#[cfg(not(feature = "mysql"))]
fn build_pipeline(
    _config: &LakesyncConfig,
    _writer: SharedTableWriter,
    _watermarks: SharedWatermarkStore,
) -> Result<Pipeline> {
    anyhow::bail!("this build has no MySQL support; enable the 'mysql' feature")
}

async fn show_watermark(config: LakesyncConfig) -> Result<()> {
    let key = config.watermark_key();
    key.validate().context("Incomplete watermark key")?;
    let catalog = build_catalog(&config).await?;
    let store = build_watermark_store(&config, catalog.as_ref()).await?;

    match store.read(&key).await? {
        Some(watermark) => println!("{}", serde_json::to_string_pretty(&watermark)?),
        None => {
            println!("No watermark stored for {key}");
        }
    }
    Ok(())
}

fn validate_config(config: LakesyncConfig) -> Result<()> {
    match config.validate() {
        Ok(()) => {
            println!("Configuration is valid");
            println!("  connection: {}", config.connection_name);
            println!("  table:      {}.{}", config.source.schema, config.source.table);
            println!("  mode:       {}", config.mode);
            println!("  source:     {}:{} (server id {})", config.source.host, config.source.port, config.source.server_id);
            println!("  batch:      {} events / {} ms", config.batch.size, config.batch.flush_interval_ms);
            println!("  table store:     {:?}", config.table_store.kind);
            println!("  watermark store: {:?}", config.watermark_store.kind);
            if config.dry_run {
                println!("  dry run:         yes");
            }
            Ok(())
        }
        Err(e) => {
            error!("Configuration is invalid: {e:#}");
            Err(e)
        }
    }
}
