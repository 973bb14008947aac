// src/main.rs
// Engram - Tiered knowledge-memory engine for AI coding assistants

use anyhow::Result;
use clap::{Parser, Subcommand};
use engram::config::file::data_dir;
use engram::{spawn_housekeeping_scheduler, EngineConfig, MemoryEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "engram")]
#[command(about = "Tiered knowledge-memory engine for AI coding assistants")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store counters and housekeeping state
    Stats,

    /// Run housekeeping (analyze, preview, execute, verify)
    Flush {
        /// Compute and print the preview without mutating anything
        #[arg(long)]
        dry_run: bool,

        /// Purge delete-candidates in this run instead of staging
        /// archive-then-purge across the grace period
        #[arg(long)]
        force: bool,
    },

    /// Export both stores to a JSON file
    Export {
        /// Destination path
        path: PathBuf,
    },

    /// Import a JSON export into empty stores
    Import {
        /// Source path
        path: PathBuf,
    },

    /// Run the housekeeping scheduler until interrupted
    Watch {
        /// Override the configured flush cadence in seconds
        #[arg(short, long)]
        interval_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    let mut config = EngineConfig::load()?;
    if let Commands::Watch {
        interval_secs: Some(secs),
    } = &cli.command
    {
        config.housekeeping.interval_secs = *secs;
        config.validate()?;
    }

    let dir = data_dir();
    let engine = Arc::new(MemoryEngine::open(&dir, config).await?);

    match cli.command {
        Commands::Stats => {
            let stats = engine.stats().await?;
            print!("{}", stats.render());
        }
        Commands::Flush { dry_run, force } => {
            let report = engine.run_housekeeping(dry_run, force).await?;
            print!("{}", report.render());
        }
        Commands::Export { path } => {
            let summary = engine.export(&path).await?;
            println!(
                "Exported {} conversations ({} turns), {} patterns, {} relationships to {}",
                summary.conversations,
                summary.turns,
                summary.patterns,
                summary.relationships,
                path.display()
            );
        }
        Commands::Import { path } => {
            let summary = engine.import(&path).await?;
            println!(
                "Imported {} conversations ({} turns), {} patterns, {} relationships from {}",
                summary.conversations,
                summary.turns,
                summary.patterns,
                summary.relationships,
                path.display()
            );
        }
        Commands::Watch { .. } => {
            let interval = engine.config().read().await.housekeeping.interval_secs;
            info!("Housekeeping scheduler running (cadence {interval}s); Ctrl-C to stop");
            let handle = spawn_housekeeping_scheduler(engine.clone());

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down scheduler");
                }
                _ = handle => {
                    tracing::error!("Housekeeping scheduler unexpectedly terminated");
                }
            }
        }
    }

    Ok(())
}
