//! Configuration module for the aesdsocket server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for timestamp interval and initial delay (one year).
const MAX_TIMESTAMP_SECS: u64 = 365 * 24 * 60 * 60;

/// Command-line arguments for the packet log server
#[derive(Parser, Debug)]
#[command(name = "aesdsocket")]
#[command(author = "aesdsocket authors")]
#[command(version = "0.1.0")]
#[command(about = "Appends newline-terminated packets to a shared log and echoes the log back", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run detached from the controlling terminal
    #[arg(short, long)]
    pub daemon: bool,

    /// Address to bind to (e.g., 0.0.0.0:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Path of the shared packet log
    #[arg(short = 'f', long)]
    pub data_file: Option<PathBuf>,

    /// Seconds between timestamp lines
    #[arg(short = 'i', long)]
    pub timestamp_interval: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub timestamp: TimestampConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and process configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Pending connection queue length
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Detach from the controlling terminal
    #[serde(default)]
    pub daemon: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            daemon: false,
        }
    }
}

/// Packet log location
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_file")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_data_file(),
        }
    }
}

/// Per-connection receive settings
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Bytes requested per socket read
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Largest packet accepted before the connection is dropped
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// How often a blocked receive wakes up to check for shutdown
    #[serde(default = "default_recv_poll_ms")]
    pub recv_poll_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_packet_size: default_max_packet_size(),
            recv_poll_ms: default_recv_poll_ms(),
        }
    }
}

/// Periodic timestamp settings
#[derive(Debug, Deserialize)]
pub struct TimestampConfig {
    /// Seconds between timestamp lines
    #[serde(default = "default_timestamp_interval")]
    pub interval: u64,
    /// Seconds before the first timestamp line
    #[serde(default = "default_timestamp_delay")]
    pub initial_delay: u64,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            interval: default_timestamp_interval(),
            initial_delay: default_timestamp_delay(),
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

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_backlog() -> i32 {
    10
}

fn default_data_file() -> PathBuf {
    PathBuf::from("/var/tmp/aesdsocketdata")
}

fn default_chunk_size() -> usize {
    1024
}

fn default_max_packet_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_recv_poll_ms() -> u64 {
    500
}

fn default_timestamp_interval() -> u64 {
    10
}

fn default_timestamp_delay() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub daemon: bool,
    pub data_file: PathBuf,
    pub chunk_size: usize,
    pub max_packet_size: usize,
    pub recv_poll_ms: u64,
    pub timestamp_interval: u64,
    pub timestamp_delay: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args against the optional TOML file.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: toml_config.server.backlog,
            daemon: cli.daemon || toml_config.server.daemon,
            data_file: cli.data_file.unwrap_or(toml_config.store.path),
            chunk_size: toml_config.connection.chunk_size,
            max_packet_size: toml_config.connection.max_packet_size,
            recv_poll_ms: toml_config.connection.recv_poll_ms,
            timestamp_interval: cli
                .timestamp_interval
                .unwrap_or(toml_config.timestamp.interval),
            timestamp_delay: toml_config.timestamp.initial_delay,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1"));
        }
        if self.max_packet_size == 0 {
            return Err(ConfigError::Invalid("max_packet_size must be at least 1"));
        }
        if self.recv_poll_ms == 0 {
            return Err(ConfigError::Invalid("recv_poll_ms must be at least 1"));
        }
        if self.timestamp_interval == 0 {
            return Err(ConfigError::Invalid("timestamp interval must be at least 1 second"));
        }
        if self.timestamp_interval > MAX_TIMESTAMP_SECS {
            return Err(ConfigError::Invalid("timestamp interval must be at most one year"));
        }
        if self.timestamp_delay > MAX_TIMESTAMP_SECS {
            return Err(ConfigError::Invalid("timestamp initial_delay must be at most one year"));
        }
        Ok(())
    }

    pub fn recv_poll(&self) -> Duration {
        Duration::from_millis(self.recv_poll_ms)
    }

    pub fn timestamp_period(&self) -> Duration {
        Duration::from_secs(self.timestamp_interval)
    }

    pub fn timestamp_initial_delay(&self) -> Duration {
        Duration::from_secs(self.timestamp_delay)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
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
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
