//! # Catalog Ingest CLI (`catalog-ingest`)
//!
//! ## Usage
//!
//! ```bash
//! catalog-ingest --config ./config/catalog.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `catalog-ingest init` | Create the SQLite database and run schema migrations |
//! | `catalog-ingest sync` | Ingest every configured category |
//! | `catalog-ingest stats` | Show row counts per table and origin |
//! | `catalog-ingest pressure` | Show the current memory pressure level |

use catalog_ingest::ingest::{self, ReportFormat};
use catalog_ingest::{config, logging, migrate, pressure, stats};

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

/// Catalog Ingest: a concurrent, memory-aware catalog ingestion pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "catalog-ingest",
    about = "Catalog Ingest: a concurrent, memory-aware catalog ingestion pipeline",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/catalog.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the catalog_records,
    /// source_references and variants tables. Idempotent.
    Init,

    /// Ingest configured categories.
    ///
    /// Runs one producer per category concurrently, commits deduplicated
    /// batches atomically and prints a per-category report.
    Sync {
        /// Restrict the run to these categories (repeatable).
        #[arg(long = "category")]
        categories: Vec<String>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show catalog statistics.
    Stats,

    /// Sample memory usage and show the resulting throttle level.
    Pressure,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_json)?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync { categories, json } => {
            let format = if json {
                ReportFormat::Json
            } else {
                ReportFormat::Text
            };
            ingest::run_sync(&cfg, &categories, format).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Pressure => {
            let probe = Arc::new(pressure::ProcessMemoryProbe::new(cfg.pressure.capacity_mb));
            let monitor = pressure::PressureMonitor::new(
                probe,
                cfg.pressure.thresholds,
                cfg.pressure.delays,
            );
            let sample = monitor.sample();
            println!("capacity: {} MB", cfg.pressure.capacity_mb);
            println!("usage: {:.1}%", sample.ratio * 100.0);
            println!("level: {}", sample.level);
            println!("delay: {} ms", sample.delay.as_millis());
        }
    }

    Ok(())
}
