//! Configuration module for contact-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::{default_contacts, Contact};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the contact server
#[derive(Parser, Debug, Default)]
#[command(name = "contact-server")]
#[command(author = "contact-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A rate-limited TCP contact menu server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:1337)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent sessions
    #[arg(short = 'c', long)]
    pub max_connections: Option<usize>,

    /// Maximum accepted input line length in bytes
    #[arg(long)]
    pub max_input_size: Option<usize>,

    /// Total session lifetime in seconds
    #[arg(long)]
    pub conn_timeout: Option<u64>,

    /// Idle time allowed between input lines in seconds
    #[arg(long)]
    pub read_timeout: Option<u64>,

    /// Rate limit window in seconds
    #[arg(long)]
    pub rate_window: Option<u64>,

    /// Connections allowed per address within the rate limit window
    #[arg(long)]
    pub rate_max: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Replaces the built-in contact list when present
    #[serde(default)]
    pub contacts: Option<Vec<Contact>>,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds to wait for sessions to drain on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

/// Per-session limits
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Maximum input line length in bytes
    #[serde(default = "default_max_input_size")]
    pub max_input_size: usize,
    /// Absolute session timeout in seconds
    #[serde(default = "default_conn_timeout")]
    pub conn_timeout: u64,
    /// Rolling read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_input_size: default_max_input_size(),
            conn_timeout: default_conn_timeout(),
            read_timeout: default_read_timeout(),
        }
    }
}

/// Per-address rate limiting
#[derive(Debug, Deserialize)]
pub struct RateLimitConfig {
    /// Sliding window length in seconds
    #[serde(default = "default_rate_window")]
    pub window: u64,
    /// Connections allowed per address within the window
    #[serde(default = "default_rate_max")]
    pub max: usize,
    /// Interval between sweeps of stale records in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: default_rate_window(),
            max: default_rate_max(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Upper bound for every configured duration (one day)
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound for `max_input_size` (1 MB)
pub const MAX_INPUT_SIZE_LIMIT: usize = 1024 * 1024;

fn default_listen() -> String {
    "0.0.0.0:1337".to_string()
}

fn default_max_connections() -> usize {
    100
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_max_input_size() -> usize {
    1024 // 1 KB
}

fn default_conn_timeout() -> u64 {
    60
}

fn default_read_timeout() -> u64 {
    30
}

fn default_rate_window() -> u64 {
    10
}

fn default_rate_max() -> usize {
    5
}

fn default_cleanup_interval() -> u64 {
    60 // 60 seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub shutdown_grace: Duration,
    pub max_input_size: usize,
    pub conn_timeout: Duration,
    pub read_timeout: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max: usize,
    pub rate_limit_cleanup_interval: Duration,
    pub log_level: String,
    pub contacts: Vec<Contact>,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            shutdown_grace: Duration::from_secs(toml_config.server.shutdown_grace),
            max_input_size: cli
                .max_input_size
                .unwrap_or(toml_config.limits.max_input_size),
            conn_timeout: Duration::from_secs(
                cli.conn_timeout.unwrap_or(toml_config.limits.conn_timeout),
            ),
            read_timeout: Duration::from_secs(
                cli.read_timeout.unwrap_or(toml_config.limits.read_timeout),
            ),
            rate_limit_window: Duration::from_secs(
                cli.rate_window.unwrap_or(toml_config.rate_limit.window),
            ),
            rate_limit_max: cli.rate_max.unwrap_or(toml_config.rate_limit.max),
            rate_limit_cleanup_interval: Duration::from_secs(
                toml_config.rate_limit.cleanup_interval,
            ),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            contacts: toml_config.contacts.unwrap_or_else(default_contacts),
        }
    }

    /// Reject values that would make the server unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |name: &str| {
            Err(ConfigError::Invalid(format!(
                "{name} must be greater than zero"
            )))
        };

        if self.workers == Some(0) {
            return zero("workers");
        }
        if self.max_connections == 0 {
            return zero("max_connections");
        }
        if self.max_input_size == 0 {
            return zero("max_input_size");
        }
        if self.max_input_size > MAX_INPUT_SIZE_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_input_size must be at most {MAX_INPUT_SIZE_LIMIT} bytes"
            )));
        }
        if self.conn_timeout.is_zero() {
            return zero("conn_timeout");
        }
        if self.read_timeout.is_zero() {
            return zero("read_timeout");
        }
        if self.rate_limit_window.is_zero() {
            return zero("rate_limit.window");
        }
        if self.rate_limit_cleanup_interval.is_zero() {
            return zero("rate_limit.cleanup_interval");
        }
        if self.rate_limit_max == 0 {
            return zero("rate_limit.max");
        }

        let durations = [
            ("conn_timeout", self.conn_timeout),
            ("read_timeout", self.read_timeout),
            ("rate_limit.window", self.rate_limit_window),
            ("rate_limit.cleanup_interval", self.rate_limit_cleanup_interval),
            ("shutdown_grace", self.shutdown_grace),
        ];
        for (name, value) in durations {
            if value > MAX_DURATION {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at most {} seconds",
                    MAX_DURATION.as_secs()
                )));
            }
        }

        if self.contacts.is_empty() {
            return Err(ConfigError::Invalid(
                "contact list must not be empty".to_string(),
            ));
        }
        // The menu numbers entries 1..=N and selects them by that number
        for (position, contact) in self.contacts.iter().enumerate() {
            if contact.index != position + 1 {
                return Err(ConfigError::Invalid(format!(
                    "contact '{}' has index {}, expected {}",
                    contact.label,
                    contact.index,
                    position + 1
                )));
            }
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
