//! Sync command orchestration.
//!
//! Wires configuration, the SQLite catalog store and the configured category
//! sources into a [`Pipeline`] run and prints the resulting report. Ctrl-C
//! cancels the run cooperatively: buffered records are still committed.

use std::sync::Arc;

use anyhow::{bail, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::pipeline::Pipeline;
use crate::report::RunReport;
use crate::source::{sources_from_config, CatalogSource};
use crate::store::sqlite::SqliteCatalogStore;

/// Output format of the sync summary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportFormat {
    Text,
    Json,
}

pub async fn run_sync(config: &Config, categories: &[String], format: ReportFormat) -> Result<()> {
    let sources = sources_from_config(config, categories)?;
    if sources.is_empty() {
        bail!("No categories configured. Add [[categories]] entries to the config file.");
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let listener = spawn_interrupt_listener(on_signal);
    let report = run_sync_with_sources(config, sources, cancel).await;
    listener.abort();
    let report = report?;

    match format {
        ReportFormat::Text => print!("{}", report.render_text()),
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    if report.invariant_violations > 0 {
        bail!(
            "{} commit(s) rejected on uniqueness conflicts after deduplication; this is a bug, not a data problem",
            report.invariant_violations
        );
    }
    Ok(())
}

/// Cancel `token` on Ctrl-C. The caller aborts the returned task once the run
/// is over.
fn spawn_interrupt_listener(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight commits");
            token.cancel();
        }
    })
}

/// Run the pipeline against the configured database with caller-supplied
/// sources. The schema is created if missing.
pub async fn run_sync_with_sources(
    config: &Config,
    sources: Vec<Box<dyn CatalogSource>>,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let store = Arc::new(SqliteCatalogStore::new(pool.clone()));
    let pipeline = Pipeline::from_config(config, store);
    let report = pipeline.run(sources, cancel).await;

    pool.close().await;
    report
}
