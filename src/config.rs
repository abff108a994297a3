//! Type-safe configuration loader using the `config` crate,
//! with manual environment-variable overrides for core settings.

use serde::Deserialize;
use humantime_serde;
use humantime;
use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};
use config::{Config, ConfigError, File};

use crate::errors::IngestError;
use crate::loader::SourceSpec;
use crate::workflow::DefaultArgs;

/// Top-level application settings loaded from `Config.toml`
/// and then overridden (where applicable) by environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Dolt sql-server connection URL (MySQL protocol)
    pub database_url: String,

    /// Base URL that short `owner/repo` remote names resolve against
    #[serde(default = "default_remote_host")]
    pub remote_host: String,

    /// Remote alias pushed to after a sync
    #[serde(default = "default_remote_name")]
    pub remote_name: String,

    /// Branch pushed to after a sync
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Directory holding the per-dataset import scripts run by shell tasks
    #[serde(default = "default_dags_folder")]
    pub dags_folder: PathBuf,

    /// Load and log directives but never commit or push
    #[serde(default)]
    pub dry_run: bool,

    /// How often the scheduler checks for due workflows (e.g. "30s", "1m")
    #[serde(with = "humantime_serde", default = "default_tick_interval")]
    pub tick_interval: Duration,

    /// HTTP bind address for metrics & health endpoints
    pub server_bind: String,

    /// Arguments shared by every registered workflow
    #[serde(default)]
    pub default_args: DefaultArgs,

    /// One-off bulk CSV importer
    #[serde(default)]
    pub importer: ImporterSettings,

    /// Row sources per dataset, keyed by the dataset name a task references.
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetSettings>,
}

/// Where the entity exports live and which local database receives them.
#[derive(Debug, Deserialize, Clone)]
pub struct ImporterSettings {
    #[serde(default = "default_importer_root")]
    pub root: PathBuf,

    #[serde(default = "default_importer_database")]
    pub database: String,
}

impl Default for ImporterSettings {
    fn default() -> Self {
        ImporterSettings {
            root: default_importer_root(),
            database: default_importer_database(),
        }
    }
}

/// The sources a dataset loader turns into load directives, in order.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatasetSettings {
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
}

fn default_remote_host() -> String {
    "https://doltremoteapi.dolthub.com/".to_string()
}

fn default_remote_name() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "master".to_string()
}

fn default_dags_folder() -> PathBuf {
    PathBuf::from("dags")
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_importer_root() -> PathBuf {
    PathBuf::from("player-data")
}

fn default_importer_database() -> String {
    "nba_players".to_string()
}

impl Settings {
    /// Load settings from `Config.toml` (if present),
    /// then apply any overrides from these environment variables:
    ///
    /// - `APP__DATABASE_URL`
    /// - `APP__TICK_INTERVAL`
    /// - `APP__SERVER_BIND`
    /// - `APP__DAGS_FOLDER`
    /// - `APP__DRY_RUN`
    /// - `APP__IMPORTER_ROOT`
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("Config")
    }

    /// Same as [`Settings::new`] but reading an explicit config file stem.
    pub fn from_file(name: &str) -> Result<Self, ConfigError> {
        // 1) Base defaults from the config file
        let cfg = Config::builder()
            .add_source(File::with_name(name).required(false))
            .build()?;

        // Deserialize everything straight away
        let mut settings: Settings = cfg.try_deserialize()?;

        // 2) Manual overrides for core settings
        if let Ok(val) = env::var("APP__DATABASE_URL") {
            settings.database_url = val;
        }
        if let Ok(val) = env::var("APP__TICK_INTERVAL") {
            settings.tick_interval = humantime::parse_duration(&val)
                .map_err(|e| ConfigError::Foreign(Box::new(e)))?;
        }
        if let Ok(val) = env::var("APP__SERVER_BIND") {
            settings.server_bind = val;
        }
        if let Ok(val) = env::var("APP__DAGS_FOLDER") {
            settings.dags_folder = PathBuf::from(val);
        }
        if let Ok(val) = env::var("APP__DRY_RUN") {
            settings.dry_run = val
                .parse()
                .map_err(|e| ConfigError::Foreign(Box::new(e)))?;
        }
        if let Ok(val) = env::var("APP__IMPORTER_ROOT") {
            settings.importer.root = PathBuf::from(val);
        }

        Ok(settings)
    }

    /// Parsed `server_bind`.
    pub fn bind_addr(&self) -> Result<SocketAddr, IngestError> {
        self.server_bind
            .parse()
            .map_err(|e| IngestError::Bind(self.server_bind.clone(), e))
    }

    /// Sources for a dataset; an unknown dataset yields an empty slice.
    pub fn dataset_sources(&self, dataset: &str) -> &[SourceSpec] {
        self.datasets
            .get(dataset)
            .map(|d| d.sources.as_slice())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ImportMode;
    use std::io::Write;

    #[test]
    fn loads_toml_with_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
database_url = "mysql://root@127.0.0.1:3306"
server_bind = "127.0.0.1:9101"

[default_args]
owner = "etl"
retry_delay = "2m"

[[datasets.fx_rates_raw.sources]]
table = "eur_fx_rates"
url = "https://example.com/fx/{{date}}.csv"
primary_key = ["currency", "timestamp"]
mode = "append"
"#
        )
        .unwrap();

        let stem = file.path().with_extension("");
        let settings = Settings::from_file(stem.to_str().unwrap()).unwrap();

        assert_eq!(settings.remote_name, "origin");
        assert_eq!(settings.branch, "master");
        assert_eq!(settings.tick_interval, Duration::from_secs(30));
        assert_eq!(settings.importer.root, PathBuf::from("player-data"));
        assert_eq!(settings.default_args.owner, "etl");
        assert_eq!(settings.default_args.retry_delay, Duration::from_secs(120));
        assert!(!settings.default_args.catchup);

        let sources = settings.dataset_sources("fx_rates_raw");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].mode, ImportMode::Append);
        assert_eq!(sources[0].url, "https://example.com/fx/{date}.csv");
        assert!(settings.dataset_sources("mta").is_empty());
        assert_eq!(settings.bind_addr().unwrap().port(), 9101);
    }

    #[test]
    fn malformed_bind_address_is_reported() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
database_url = "mysql://root@127.0.0.1:3306"
server_bind = "localhost"
"#
        )
        .unwrap();

        let stem = file.path().with_extension("");
        let settings = Settings::from_file(stem.to_str().unwrap()).unwrap();
        let err = settings.bind_addr().unwrap_err();
        assert!(matches!(err, IngestError::Bind(addr, _) if addr == "localhost"));
    }
}
