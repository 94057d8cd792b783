//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/beacon/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/beacon/` (~/.config/beacon/)
//! - Data: `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
//! - Cache: `$XDG_CACHE_HOME/beacon/` (~/.cache/beacon/)
//! - State/Logs: `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default ingestion endpoint
pub const DEFAULT_ENDPOINT: &str = "https://ingest.beacon.dev/v1/events";

/// Environment variable that overrides `tracker.api_key`
pub const API_KEY_ENV: &str = "BEACON_API_KEY";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_CACHE_HOME or ~/.cache
fn xdg_cache_home() -> PathBuf {
    std::env::var("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".cache"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Tracker settings (credentials, batching, delivery)
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Offline cache storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Connectivity probe settings
    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Deployment environment of the embedding application
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    #[default]
    Prod,
}

impl Environment {
    /// Log level used when neither `RUST_LOG` nor `logging.level` is set
    pub fn default_log_level(&self) -> &'static str {
        match self {
            Environment::Dev => "debug",
            Environment::Prod => "info",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
        }
    }
}

/// Tracker configuration
///
/// Immutable for the lifetime of one tracker instance.
#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    /// Shared secret used to sign batches
    #[serde(default)]
    pub api_key: String,

    /// Project the events belong to
    #[serde(default)]
    pub project_id: String,

    /// Deployment environment
    #[serde(default)]
    pub environment: Environment,

    /// Events per batch before an immediate flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Milliseconds before an incomplete batch is flushed
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Retry attempts after the first failed send
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Ingestion endpoint URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            project_id: String::new(),
            environment: Environment::default(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retries: default_max_retries(),
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl TrackerConfig {
    /// Create a configuration with credentials and defaults for everything else
    pub fn new(api_key: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            project_id: project_id.into(),
            ..Default::default()
        }
    }

    /// Get the flush interval
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Error::Config("tracker.api_key is required".to_string()));
        }
        if self.project_id.trim().is_empty() {
            return Err(Error::Config("tracker.project_id is required".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config(
                "tracker.batch_size must be at least 1".to_string(),
            ));
        }

        let url = reqwest::Url::parse(&self.endpoint)
            .map_err(|e| Error::Config(format!("invalid tracker.endpoint: {}", e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::Config(format!(
                "tracker.endpoint must be http or https, got {}",
                url.scheme()
            )));
        }
        Ok(())
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_max_retries() -> usize {
    3
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Which storage backend holds the offline cache
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// SQLite when the database opens, otherwise files
    #[default]
    Auto,
    Sqlite,
    File,
}

/// Offline cache storage configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Override for the SQLite database path
    pub database_path: Option<PathBuf>,

    /// Override for the file store directory
    pub cache_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(Config::database_path)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(Config::cache_dir)
    }
}

/// Connectivity probe configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectivityConfig {
    /// Seconds between reachability probes (0 disables the probe)
    #[serde(default)]
    pub probe_interval_secs: u64,
}

impl ConnectivityConfig {
    pub fn probe_interval(&self) -> Option<Duration> {
        (self.probe_interval_secs > 0).then(|| Duration::from_secs(self.probe_interval_secs))
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); defaults per environment
    #[serde(default)]
    pub level: Option<String>,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            max_files: default_max_log_files(),
        }
    }
}

impl LoggingConfig {
    /// Resolve the effective level for the given environment
    pub fn level_for(&self, environment: Environment) -> &str {
        self.level
            .as_deref()
            .unwrap_or_else(|| environment.default_log_level())
    }
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Config::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(api_key) = std::env::var(API_KEY_ENV) {
            if !api_key.trim().is_empty() {
                self.tracker.api_key = api_key;
            }
        }
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/beacon/config.toml` (~/.config/beacon/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("beacon").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite offline cache)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("beacon")
    }

    /// Returns the cache directory path (for the file offline cache)
    pub fn cache_dir() -> PathBuf {
        xdg_cache_home().join("beacon")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("beacon")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/beacon/offline.db` (~/.local/share/beacon/offline.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("offline.db")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("beacon.log")
    }
}
