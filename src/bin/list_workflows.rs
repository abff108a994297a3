//! Print every registered workflow (schedule, start date, default args and
//! task graph) as JSON.

use anyhow::Result;
use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

use tabular_ingest::config::Settings;
use tabular_ingest::registry;
use tabular_ingest::workflow::DefaultArgs;

fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let defaults = match Settings::new() {
        Ok(settings) => settings.default_args,
        Err(e) => {
            warn!(error = %e, "No usable configuration, using built-in default args");
            DefaultArgs::default()
        }
    };

    let workflows = registry::build(&defaults)?;
    println!("{}", serde_json::to_string_pretty(&registry::describe(&workflows))?);
    Ok(())
}
