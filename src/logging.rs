use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Honours `RUST_LOG`; defaults to `catalog_ingest=info`. Logs go to stderr
/// so stdout stays parseable.
pub fn init(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("catalog_ingest=info"))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    // A subscriber may already be installed (tests, embedding applications).
    if let Err(e) = installed {
        eprintln!("Warning: logging not initialized: {}", e);
    }
    Ok(())
}
