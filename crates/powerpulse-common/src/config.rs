//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the core runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8082))
}

fn default_history_limit() -> usize {
    100
}

fn default_subscriber_queue() -> usize {
    64
}

fn default_store_directory() -> PathBuf {
    PathBuf::from("target/powerpulse/store")
}

fn default_prediction_enabled() -> bool {
    true
}

fn default_prediction_url() -> String {
    "http://localhost:8083".to_owned()
}

fn default_prediction_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

/// Load a `.env` file from the working directory (or its parents) into the process
/// environment. Returns the path that was loaded, if any.
pub fn load_env_file() -> Option<PathBuf> {
    match dotenvy::dotenv() {
        Ok(path) => {
            debug!(env_file = %path.display(), "environment file loaded");
            Some(path)
        }
        Err(_) => None,
    }
}

/// Primary configuration object for the PowerPulse runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub accumulator: AccumulatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and defaults were used.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "POWERPULSE_CONFIG";
    pub const ENV_LISTEN: &'static str = "POWERPULSE_LISTEN";
    pub const ENV_STORE_DIR: &'static str = "POWERPULSE_STORE_DIR";
    pub const ENV_INPUT: &'static str = "POWERPULSE_INPUT";
    pub const ENV_PREDICTION_URL: &'static str = "ML_API_URL";

    /// Load configuration, respecting the `POWERPULSE_CONFIG` override and the
    /// environment variable overrides.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration together with the effective source path.
    ///
    /// An explicit `POWERPULSE_CONFIG` path must exist. Otherwise the first existing
    /// candidate wins, falling back to built-in defaults.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        let (mut config, source) = match std::env::var(Self::ENV_CONFIG_PATH) {
            Ok(env_path) if !env_path.trim().is_empty() => {
                let path = PathBuf::from(env_path);
                (Self::from_path(&path)?, Some(path))
            }
            _ => match candidates.iter().find(|c| c.as_ref().exists()) {
                Some(candidate) => {
                    let path = candidate.as_ref().to_path_buf();
                    (Self::from_path(&path)?, Some(path))
                }
                None => {
                    debug!("no configuration file found; using defaults");
                    (AppConfig::default(), None)
                }
            },
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(LoadedAppConfig { config, source })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(listen) = var(Self::ENV_LISTEN) {
            self.server.listen = listen
                .trim()
                .parse()
                .with_context(|| format!("invalid {} value '{}'", Self::ENV_LISTEN, listen))?;
        }
        if let Some(dir) = var(Self::ENV_STORE_DIR) {
            self.store.directory = PathBuf::from(dir.trim());
        }
        if let Some(input) = var(Self::ENV_INPUT) {
            self.stream.input = Some(input.trim().to_owned());
        }
        if let Some(url) = var(Self::ENV_PREDICTION_URL) {
            self.prediction.base_url = url.trim().to_owned();
        }
        Ok(())
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.accumulator.validate()?;
        self.prediction.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Listener shared by the subscriber transport and the query API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Number of samples returned by the history endpoints.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Outbound queue depth per subscriber.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            history_limit: default_history_limit(),
            subscriber_queue: default_subscriber_queue(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_limit == 0 {
            return Err(anyhow!("server.history_limit must be greater than zero"));
        }
        if self.subscriber_queue == 0 {
            return Err(anyhow!("server.subscriber_queue must be greater than zero"));
        }
        Ok(())
    }
}

/// Inbound telemetry stream.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamConfig {
    /// Newline-delimited JSON events: a file path, or `-` for stdin. Unset disables ingestion.
    #[serde(default)]
    pub input: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Jsonl,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_directory")]
    pub directory: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            directory: default_store_directory(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    #[serde(default = "default_prediction_enabled")]
    pub enabled: bool,
    #[serde(default = "default_prediction_url")]
    pub base_url: String,
    #[serde(default = "default_prediction_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            enabled: default_prediction_enabled(),
            base_url: default_prediction_url(),
            timeout: default_prediction_timeout(),
        }
    }
}

impl PredictionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled {
            url::Url::parse(&self.base_url).with_context(|| {
                format!("prediction.base_url '{}' is not a valid url", self.base_url)
            })?;
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccumulatorConfig {
    /// Discard a partial sample once it has waited this long. Unset keeps it indefinitely.
    #[serde(default)]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub max_pending_age: Option<Duration>,
}

impl AccumulatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_pending_age == Some(Duration::ZERO) {
            return Err(anyhow!(
                "accumulator.max_pending_age must be greater than zero when set"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Expose Prometheus metrics at `/metrics` on the server listener.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.server.listen.port(), 8082);
        assert_eq!(config.server.history_limit, 100);
        assert_eq!(config.prediction.base_url, "http://localhost:8083");
        assert!(config.accumulator.max_pending_age.is_none());
        assert_eq!(config.store.backend, StoreBackend::Jsonl);
        assert!(config.stream.input.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn parses_toml_sections() {
        let config: AppConfig = r#"
            [server]
            listen = "127.0.0.1:9000"
            history_limit = 25

            [stream]
            input = "-"

            [store]
            backend = "memory"

            [prediction]
            enabled = false
            timeout = 2

            [accumulator]
            max_pending_age = 30

            [logging]
            format = "pretty"
        "#
        .parse()
        .unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.server.history_limit, 25);
        assert_eq!(config.server.subscriber_queue, 64);
        assert_eq!(config.stream.input.as_deref(), Some("-"));
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(!config.prediction.enabled);
        assert_eq!(config.prediction.timeout, Duration::from_secs(2));
        assert_eq!(
            config.accumulator.max_pending_age,
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn validation_rejects_degenerate_values() {
        assert!("[server]\nhistory_limit = 0".parse::<AppConfig>().is_err());
        assert!("[server]\nsubscriber_queue = 0".parse::<AppConfig>().is_err());
        assert!("[accumulator]\nmax_pending_age = 0"
            .parse::<AppConfig>()
            .is_err());
        assert!("[prediction]\nbase_url = \"not a url\""
            .parse::<AppConfig>()
            .is_err());
        assert!("[prediction]\nenabled = false\nbase_url = \"not a url\""
            .parse::<AppConfig>()
            .is_ok());
    }

    #[test]
    fn overrides_replace_file_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (AppConfig::ENV_LISTEN, "127.0.0.1:7000"),
            (AppConfig::ENV_STORE_DIR, "/var/lib/powerpulse"),
            (AppConfig::ENV_INPUT, "events.jsonl"),
            (AppConfig::ENV_PREDICTION_URL, "http://ml:5000"),
        ]);
        let mut config = AppConfig::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.listen.port(), 7000);
        assert_eq!(config.store.directory, PathBuf::from("/var/lib/powerpulse"));
        assert_eq!(config.stream.input.as_deref(), Some("events.jsonl"));
        assert_eq!(config.prediction.base_url, "http://ml:5000");

        let mut config = AppConfig::default();
        assert!(config
            .apply_overrides(|key| (key == AppConfig::ENV_LISTEN).then(|| "nope".to_owned()))
            .is_err());
    }

    #[test]
    fn first_existing_candidate_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("powerpulse.toml");
        fs::write(&path, "[server]\nhistory_limit = 7\n").unwrap();
        let missing = dir.path().join("missing.toml");

        assert!(AppConfig::from_path(&missing).is_err());

        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source, Some(path));
        assert_eq!(loaded.config.server.history_limit, 7);
    }
}
