// ABOUTME: CLI entry point for schemasync
// ABOUTME: Prepares data stores, runs the sync loops and writes backfill watermarks

use anyhow::Context;
use clap::{Parser, Subcommand};
use schemasync::source::WatermarkKind;
use schemasync::{ManifestConfig, SyncPipeline};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "schemasync")]
#[command(about = "PostgreSQL change data capture through versioned public schemas", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create slots, publications and control tables described by the manifest
    Prepare {
        #[arg(long, env = "SCHEMASYNC_MANIFEST")]
        manifest: PathBuf,
    },
    /// Run publish and consume loops until interrupted
    Sync {
        #[arg(long, env = "SCHEMASYNC_MANIFEST")]
        manifest: PathBuf,
        /// Id of a manifest backfill to run once the loops are up; repeatable
        #[arg(long = "backfill")]
        backfills: Vec<String>,
    },
    /// Write a backfill watermark into a source data store
    Watermark {
        #[arg(long, env = "SCHEMASYNC_MANIFEST")]
        manifest: PathBuf,
        /// Data store (connection) slug
        #[arg(long)]
        data_store: String,
        /// Watermark type: low or high
        #[arg(long = "type")]
        kind: String,
        #[arg(long)]
        backfill_id: String,
    },
    /// Print the newest stored transaction id of every consumed public schema
    Tail {
        #[arg(long, env = "SCHEMASYNC_MANIFEST")]
        manifest: PathBuf,
    },
}

fn load_manifest(path: &Path) -> anyhow::Result<ManifestConfig> {
    ManifestConfig::load(path)
        .with_context(|| format!("Failed to load manifest from {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Prepare { manifest } => {
            let pipeline = SyncPipeline::from_manifest(load_manifest(&manifest)?);
            pipeline
                .prepare()
                .await
                .context("Failed to prepare data stores")?;
            tracing::info!("All data stores prepared");
            Ok(())
        }
        Commands::Sync {
            manifest,
            backfills,
        } => {
            let pipeline = SyncPipeline::from_manifest(load_manifest(&manifest)?);
            let cancel = CancellationToken::new();

            let ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("Interrupt received, shutting down");
                    ctrl_c.cancel();
                }
            });

            pipeline
                .run_with_backfills(cancel, &backfills)
                .await
                .context("Sync failed")?;
            Ok(())
        }
        Commands::Watermark {
            manifest,
            data_store,
            kind,
            backfill_id,
        } => {
            let kind: WatermarkKind = kind.parse()?;
            let pipeline = SyncPipeline::from_manifest(load_manifest(&manifest)?);
            pipeline
                .source(&data_store)?
                .write_watermark(kind, &backfill_id)
                .await
                .with_context(|| format!("Failed to write watermark to '{}'", data_store))?;
            Ok(())
        }
        Commands::Tail { manifest } => {
            let pipeline = SyncPipeline::from_manifest(load_manifest(&manifest)?);
            let cursors = pipeline
                .event_store()
                .tail(&pipeline.consumed_schemas())
                .await
                .context("Failed to read event store tail")?;
            for cursor in cursors {
                println!(
                    "{}\t{}",
                    cursor.schema,
                    cursor.transaction_id.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
    }
}
