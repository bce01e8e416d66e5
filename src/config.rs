//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage roots and directory scanning
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_roots")]
    pub roots: Vec<String>,

    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    #[serde(default = "default_midnight_scan_interval")]
    pub midnight_scan_interval_secs: u64,

    #[serde(default = "default_buffer_pool_size")]
    pub buffer_pool_size: usize,

    #[serde(default = "default_max_record_size")]
    pub max_record_size: usize,

    #[serde(default = "default_idle_handle")]
    pub idle_handle_secs: u64,
}

fn default_roots() -> Vec<String> {
    vec![dirs::data_local_dir()
        .map(|p| p.join("wavestore").to_string_lossy().to_string())
        .unwrap_or_else(|| "./wavestore_data".to_string())]
}

fn default_scan_interval() -> u64 {
    300 // 5 minutes
}

fn default_midnight_scan_interval() -> u64 {
    15
}

fn default_buffer_pool_size() -> usize {
    8
}

fn default_max_record_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_idle_handle() -> u64 {
    600
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            scan_interval_secs: default_scan_interval(),
            midnight_scan_interval_secs: default_midnight_scan_interval(),
            buffer_pool_size: default_buffer_pool_size(),
            max_record_size: default_max_record_size(),
            idle_handle_secs: default_idle_handle(),
        }
    }
}

impl StorageConfig {
    pub fn root_paths(&self) -> Vec<PathBuf> {
        self.roots.iter().map(PathBuf::from).collect()
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn midnight_scan_interval(&self) -> Duration {
        Duration::from_secs(self.midnight_scan_interval_secs)
    }

    pub fn idle_handle(&self) -> Duration {
        Duration::from_secs(self.idle_handle_secs)
    }
}

/// Disk query limits and filters
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_max_days")]
    pub max_days: i64,

    #[serde(default = "default_handle_touch")]
    pub handle_touch_secs: u64,

    #[serde(default = "default_duration")]
    pub default_duration_secs: f64,

    /// Named lists of excluded channel prefixes; `default` applies when a request names none
    #[serde(default)]
    pub exclusions: HashMap<String, Vec<String>>,

    /// Channel prefixes that are not public
    #[serde(default)]
    pub restricted: Vec<String>,

    /// Peer addresses allowed to see restricted channels
    #[serde(default)]
    pub privileged_hosts: Vec<String>,

    #[serde(default = "default_nice_bytes")]
    pub nice_bytes: usize,

    #[serde(default = "default_nice_pause")]
    pub nice_pause_ms: u64,
}

fn default_max_days() -> i64 {
    365
}

fn default_handle_touch() -> u64 {
    20
}

fn default_duration() -> f64 {
    300.0
}

fn default_nice_bytes() -> usize {
    1_000_000
}

fn default_nice_pause() -> u64 {
    100
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_days: default_max_days(),
            handle_touch_secs: default_handle_touch(),
            default_duration_secs: default_duration(),
            exclusions: HashMap::new(),
            restricted: Vec::new(),
            privileged_hosts: Vec::new(),
            nice_bytes: default_nice_bytes(),
            nice_pause_ms: default_nice_pause(),
        }
    }
}

/// Realtime memory cache
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_rt_duration")]
    pub duration_secs: f64,

    #[serde(default = "default_pre_duration")]
    pub pre_duration_secs: f64,

    /// Two-character band/instrument codes kept in memory; empty keeps all
    #[serde(default)]
    pub bands: Vec<String>,

    #[serde(default = "default_max_chunk")]
    pub max_chunk_samples: usize,

    /// Port receiving raw data records for the cache; 0 disables ingest
    #[serde(default)]
    pub ingest_port: u16,

    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

fn default_rt_duration() -> f64 {
    3600.0
}

fn default_pre_duration() -> f64 {
    2700.0
}

fn default_max_chunk() -> usize {
    1000
}

fn default_stats_interval() -> u64 {
    600
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_rt_duration(),
            pre_duration_secs: default_pre_duration(),
            bands: Vec::new(),
            max_chunk_samples: default_max_chunk(),
            ingest_port: 0,
            stats_interval_secs: default_stats_interval(),
        }
    }
}

/// Query server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2061
}

fn default_read_timeout() -> u64 {
    600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

/// Station coordinates used by the ring filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataConfig {
    #[serde(default)]
    pub stations: Vec<StationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    /// Network + station, e.g. `USDUG`
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        // Try default config locations
        let config_paths = [
            dirs::config_dir().map(|p| p.join("wavestore").join("config.toml")),
            Some(PathBuf::from("/etc/wavestore/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        // Fall back to environment-only config
        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        if let Ok(roots) = std::env::var("WAVESTORE_DATA_ROOTS") {
            let roots: Vec<String> = roots
                .split(':')
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect();
            if !roots.is_empty() {
                self.storage.roots = roots;
            }
        }

        if let Ok(host) = std::env::var("WAVESTORE_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("WAVESTORE_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }

        if let Ok(level) = std::env::var("WAVESTORE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("WAVESTORE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Wavestore Configuration
#
# Environment variables override these settings:
# - WAVESTORE_DATA_ROOTS (colon separated)
# - WAVESTORE_HOST
# - WAVESTORE_PORT
# - WAVESTORE_LOG_LEVEL
# - WAVESTORE_LOG_FORMAT

[storage]
# Directories holding YYYY_DDD_NODE.idx/.ms files (and one level of subdirectories)
roots = ["~/.local/share/wavestore"]

# Directory rescan interval (seconds)
scan_interval_secs = 300

# Rescan interval from 23:40 to 00:02 UTC (seconds)
midnight_scan_interval_secs = 15

# Scratch buffers kept for extent reads
buffer_pool_size = 8

# Largest record accepted (bytes)
max_record_size = 65536

# Close index files unused for this long (seconds)
idle_handle_secs = 600

[query]
# Longest request accepted (days)
max_days = 365

# Refresh index file last-used time during long queries (seconds)
handle_touch_secs = 20

# Duration used when a request gives no -d or -ed (seconds)
default_duration_secs = 300.0

# Channel prefixes that are not public
restricted = []

# Peers allowed to see restricted channels
privileged_hosts = ["127.0.0.1"]

# Pause nice_pause_ms after every nice_bytes sent (unless -nonice)
nice_bytes = 1000000
nice_pause_ms = 100

[query.exclusions]
# default = ["XX"]

[realtime]
# Seconds of recent data held per channel
duration_secs = 3600.0

# Seconds kept before a new block when the buffer shifts
pre_duration_secs = 2700.0

# Band/instrument codes kept in memory (empty = all)
bands = ["BH", "HH", "LH"]

# Largest chunk produced when exporting (samples)
max_chunk_samples = 1000

# Port receiving raw data records (0 = disabled)
ingest_port = 0

# How often to log cache memory use (seconds)
stats_interval_secs = 600

[server]
# Query server host
host = "0.0.0.0"

# Query server port
port = 2061

# Close idle client connections after (seconds)
read_timeout_secs = 600

# [[metadata.stations]]
# name = "USDUG"
# latitude = 40.195
# longitude = -112.813

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_template_parses() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        assert_eq!(config.server.port, 2061);
        assert_eq!(config.query.max_days, 365);
        assert_eq!(config.realtime.bands, vec!["BH", "HH", "LH"]);
        assert!(config.metadata.stations.is_empty());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[storage]
roots = ["/data/a", "/data/b"]

[query.exclusions]
default = ["XX", "ZZTEST"]

[[metadata.stations]]
name = "USDUG"
latitude = 40.2
longitude = -112.8
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.storage.root_paths().len(), 2);
        assert_eq!(config.storage.scan_interval(), Duration::from_secs(300));
        assert_eq!(config.query.exclusions["default"].len(), 2);
        assert_eq!(config.realtime.duration_secs, 3600.0);
        assert_eq!(config.metadata.stations[0].name, "USDUG");
    }

    #[test]
    fn test_bad_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
