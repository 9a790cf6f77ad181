//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;
use tally_db::{SeedConfig, StoreConfig};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Reference rows seeded on boot.
    #[serde(default)]
    pub seed: SeedConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the backing database file. `":memory:"` keeps the image in
    /// memory only.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Debounce delay of the write-back scheduler in milliseconds.
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "tally_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "tally.db".to_string()
}

fn default_flush_delay_ms() -> u64 {
    StoreConfig::DEFAULT_FLUSH_DELAY.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            flush_delay_ms: default_flush_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Builds the store boot configuration from the database and seed
    /// sections.
    pub fn store_config(&self) -> StoreConfig {
        let store = match self.database.path.as_str() {
            ":memory:" => StoreConfig::in_memory(),
            path => StoreConfig::file(PathBuf::from(path)),
        };
        store
            .with_flush_delay(Duration::from_millis(self.database.flush_delay_ms))
            .with_seed(self.seed.clone())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `TALLY_HOST` overrides `server.host`
/// - `TALLY_PORT` overrides `server.port`
/// - `TALLY_DB_PATH` overrides `database.path`
/// - `TALLY_FLUSH_DELAY_MS` overrides `database.flush_delay_ms`
/// - `TALLY_ADMIN_USERNAME` overrides `seed.admin_username`
/// - `TALLY_ADMIN_PASSWORD` overrides `seed.admin_password`
/// - `TALLY_LOG_LEVEL` overrides `logging.level`
/// - `TALLY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `TALLY_*` overrides looked up through `var`. Unparseable values
/// are ignored.
fn apply_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("TALLY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("TALLY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = var("TALLY_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(delay) = var("TALLY_FLUSH_DELAY_MS") {
        if let Ok(parsed) = delay.parse() {
            config.database.flush_delay_ms = parsed;
        }
    }
    if let Some(username) = var("TALLY_ADMIN_USERNAME") {
        config.seed.admin_username = username;
    }
    if let Some(password) = var("TALLY_ADMIN_PASSWORD") {
        config.seed.admin_password = password;
    }
    if let Some(level) = var("TALLY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("TALLY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}
