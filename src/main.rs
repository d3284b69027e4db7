use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use realty_import::config::{Config, StorageBackend};
use realty_import::domain::BatchStatus;
use realty_import::logging;
use realty_import::observability::{metrics, TracingActivityLog};
use realty_import::pipeline::photos::{BlobStore, FsBlobStore, InMemoryBlobStore};
use realty_import::pipeline::processing::normalizer::property_type_for;
use realty_import::pipeline::{fingerprint, ImportOrchestrator, ImportRequest};
use realty_import::storage::{InMemoryStorage, SqliteStorage, Storage};

#[derive(Parser)]
#[command(name = "realty-import")]
#[command(about = "Bulk real-estate feed importer")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to $REALTY_IMPORT_CONFIG, then config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a feed for one tenant and print the batch summary as JSON
    Run {
        #[arg(long)]
        tenant: Uuid,
        /// Feed source name, e.g. vista
        #[arg(long, default_value = "vista")]
        source: String,
        /// XML feed file
        #[arg(long)]
        feed: PathBuf,
        /// Owner export (XLS, XLSX or CSV)
        #[arg(long)]
        enrichment: Option<PathBuf>,
        /// User starting the import; omit for system runs
        #[arg(long)]
        created_by: Option<Uuid>,
        /// Skip photo renditions
        #[arg(long)]
        no_photos: bool,
        /// Import into memory only; nothing is persisted
        #[arg(long)]
        dry_run: bool,
        /// Write a Prometheus snapshot here when the run ends
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },
    /// Print the duplicate fingerprint for an address
    Fingerprint {
        #[arg(long)]
        street: String,
        #[arg(long)]
        number: String,
        #[arg(long)]
        neighborhood: String,
        #[arg(long)]
        city: String,
        /// Property type as written in the feed, e.g. "Apartamento"
        #[arg(long = "type")]
        property_type: String,
        /// Total area in square meters
        #[arg(long)]
        area: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    logging::init_logging(&config.logging);

    match cli.command {
        Commands::Fingerprint {
            street,
            number,
            neighborhood,
            city,
            property_type,
            area,
        } => {
            let family = property_type_for(&property_type, "");
            println!("{}", fingerprint(&street, &number, &neighborhood, &city, family, area));
        }
        Commands::Run {
            tenant,
            source,
            feed,
            enrichment,
            created_by,
            no_photos,
            dry_run,
            metrics_out,
        } => {
            if no_photos {
                config.photos.enabled = false;
            }
            if let Some(path) = metrics_out {
                config.metrics.snapshot_path = Some(path);
            }
            metrics::init(&config.metrics)?;

            let request = ImportRequest {
                tenant_id: tenant,
                source,
                created_by,
                feed: tokio::fs::read(&feed)
                    .await
                    .with_context(|| format!("failed to read feed {}", feed.display()))?,
                enrichment: match &enrichment {
                    Some(path) => Some(
                        tokio::fs::read(path)
                            .await
                            .with_context(|| format!("failed to read enrichment {}", path.display()))?,
                    ),
                    None => None,
                },
            };

            let (storage, blobs) = build_backends(&config, dry_run)?;
            let orchestrator =
                ImportOrchestrator::from_config(&config, storage, blobs, Arc::new(TracingActivityLog))?;

            let summary = orchestrator.run(&request).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if let Some(path) = &config.metrics.snapshot_path {
                if let Err(e) = metrics::write_snapshot(path) {
                    warn!("Failed to write metrics snapshot: {}", e);
                }
            }

            if summary.status == BatchStatus::Failed {
                error!(
                    "Batch {} failed: {}",
                    summary.batch_id,
                    summary.error_message.as_deref().unwrap_or("unknown error")
                );
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn build_backends(config: &Config, dry_run: bool) -> Result<(Arc<dyn Storage>, Arc<dyn BlobStore>)> {
    if dry_run || config.storage.backend == StorageBackend::Memory {
        info!("🧪 Using in-memory storage; nothing will be persisted");
        return Ok((Arc::new(InMemoryStorage::new()), Arc::new(InMemoryBlobStore::new())));
    }

    let storage = SqliteStorage::open(&config.storage.sqlite_path)
        .with_context(|| format!("failed to open {}", config.storage.sqlite_path.display()))?;
    info!("💾 Using SQLite storage at {}", config.storage.sqlite_path.display());

    let blobs = FsBlobStore::new(&config.blob.root, &config.blob.public_base_url);
    Ok((Arc::new(storage), Arc::new(blobs)))
}
