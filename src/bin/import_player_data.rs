//! One-off import of per-player CSV exports into a local Dolt database.
//!
//! Walks `<root>/<player_id>/<table_key>.csv` (root from the first argument,
//! else `importer.root` in `Config.toml`) and upserts every recognised export.
//! Changes are left uncommitted.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use tabular_ingest::config::Settings;
use tabular_ingest::dolt::DoltServer;
use tabular_ingest::importer::import_exports;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let settings = Settings::new().context("loading configuration")?;
    let root = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| settings.importer.root.clone());

    let server = DoltServer::new(&settings.database_url, &settings.remote_host)?;
    let mut session = server
        .open(&settings.importer.database)
        .await
        .with_context(|| format!("opening database {}", settings.importer.database))?;

    info!(root = %root.display(), database = session.database(), "Importing exports");

    let stdout = io::stdout();
    let mut progress = stdout.lock();
    let summary = import_exports(&root, &mut session, &mut progress).await?;

    info!(?summary, "Done; changes are uncommitted");
    Ok(())
}
