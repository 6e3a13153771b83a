//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/stockroom/config.toml)
//! 3. Environment variables (STOCKROOM_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "STOCKROOM";

/// Upper bound for the availability probe timeout
pub const MAX_PROBE_TIMEOUT_SECS: u64 = 10;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for durable client storage (SQLite key/value store)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the catalog REST API
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Collection resource name under `server_url`
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Realtime push channel URL (optional)
    #[serde(default)]
    pub realtime_url: Option<String>,

    /// Seconds between periodic server probes
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Probe timeout in seconds (clamped to 10)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Probes started this soon after the last one reuse its result
    #[serde(default = "default_probe_debounce")]
    pub probe_debounce_millis: u64,

    /// Capacity of the durable store in bytes
    #[serde(default = "default_storage_quota")]
    pub storage_quota_bytes: u64,

    /// Page size for collection listings
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Hard cap on entities returned from a whole-cache read
    #[serde(default = "default_read_all_cap")]
    pub read_all_cap: usize,

    /// Number of listing pages kept in the cache
    #[serde(default = "default_cache_max_pages")]
    pub cache_max_pages: usize,

    /// Initial realtime reconnect delay in seconds
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_secs: u64,

    /// Maximum realtime reconnect delay in seconds
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,

    /// Log level for the stockroom crates
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log file (stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server_url: default_server_url(),
            collection: default_collection(),
            realtime_url: None,
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            probe_debounce_millis: default_probe_debounce(),
            storage_quota_bytes: default_storage_quota(),
            page_size: default_page_size(),
            read_all_cap: default_read_all_cap(),
            cache_max_pages: default_cache_max_pages(),
            reconnect_initial_secs: default_reconnect_initial(),
            reconnect_max_secs: default_reconnect_max(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (STOCKROOM_DATA_DIR, STOCKROOM_SERVER_URL, ...)
    /// 2. Config file (~/.config/stockroom/config.toml or STOCKROOM_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_SERVER_URL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.server_url = val;
            }
        }

        // Empty string clears it
        if let Ok(val) = std::env::var(format!("{}_REALTIME_URL", ENV_PREFIX)) {
            self.realtime_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_STORAGE_QUOTA_BYTES", ENV_PREFIX)) {
            if let Ok(quota) = val.parse() {
                self.storage_quota_bytes = quota;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_LOG_LEVEL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.log_level = val;
            }
        }
    }

    /// Ensure data directory exists
    pub fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_file_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with STOCKROOM_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stockroom")
            .join("config.toml")
    }

    /// Get the path to the SQLite key/value store
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("stockroom.db")
    }

    /// Log file used when `log_file` is unset but file logging is requested
    pub fn default_log_path(&self) -> PathBuf {
        self.data_dir.join("stockroom.log")
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    /// Probe timeout, never longer than ten seconds
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.clamp(1, MAX_PROBE_TIMEOUT_SECS))
    }

    pub fn probe_debounce(&self) -> Duration {
        Duration::from_millis(self.probe_debounce_millis)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_secs(self.reconnect_initial_secs.max(1))
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_secs.max(self.reconnect_initial_secs).max(1))
    }

    /// Set a value by key name, as used by `stockroom config set`
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid value for {}: {}", key, value))
        }

        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "server_url" => self.server_url = value.to_string(),
            "collection" => self.collection = value.to_string(),
            "realtime_url" => {
                self.realtime_url = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "probe_interval_secs" => self.probe_interval_secs = parse(key, value)?,
            "probe_timeout_secs" => self.probe_timeout_secs = parse(key, value)?,
            "probe_debounce_millis" => self.probe_debounce_millis = parse(key, value)?,
            "storage_quota_bytes" => self.storage_quota_bytes = parse(key, value)?,
            "page_size" => self.page_size = parse(key, value)?,
            "read_all_cap" => self.read_all_cap = parse(key, value)?,
            "cache_max_pages" => self.cache_max_pages = parse(key, value)?,
            "reconnect_initial_secs" => self.reconnect_initial_secs = parse(key, value)?,
            "reconnect_max_secs" => self.reconnect_max_secs = parse(key, value)?,
            "log_level" => self.log_level = value.to_string(),
            "log_file" => {
                self.log_file = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                }
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stockroom")
}

fn default_server_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_collection() -> String {
    "products".to_string()
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    MAX_PROBE_TIMEOUT_SECS
}

fn default_probe_debounce() -> u64 {
    500
}

fn default_storage_quota() -> u64 {
    5 * 1024 * 1024
}

fn default_page_size() -> u32 {
    50
}

fn default_read_all_cap() -> usize {
    500
}

fn default_cache_max_pages() -> usize {
    20
}

fn default_reconnect_initial() -> u64 {
    1
}

fn default_reconnect_max() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}
