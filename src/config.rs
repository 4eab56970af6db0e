//! Configuration module for line-relay.
//!
//! Supports both command-line arguments and an optional TOML configuration
//! file. The bind address always comes from the command line; CLI flags take
//! precedence over config file values for everything else.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "line-relay")]
#[command(version = "0.1.0")]
#[command(about = "Relays every received line to all other connected clients", long_about = None)]
pub struct CliArgs {
    /// Address to bind to (e.g., 127.0.0.1)
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Read buffer size in bytes; also the longest accepted line
    #[arg(short = 'r', long)]
    pub read_buffer_size: Option<usize>,

    /// Maximum number of simultaneous clients
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

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
    pub buffers: BufferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Maximum number of simultaneous clients
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Readiness events fetched per dispatch
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Buffer sizing
#[derive(Debug, Deserialize)]
pub struct BufferConfig {
    /// Per-connection read buffer size. The write buffer is eight times this.
    #[serde(default = "default_read_size")]
    pub read_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            read_size: default_read_size(),
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

/// Write buffer capacity as a multiple of the read buffer capacity.
pub const WRITE_BUFFER_FACTOR: usize = 8;

fn default_max_connections() -> usize {
    10_000
}

fn default_backlog() -> i32 {
    1000
}

fn default_events_capacity() -> usize {
    1024
}

fn default_read_size() -> usize {
    128
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub read_buffer_size: usize,
    pub max_connections: usize,
    pub backlog: i32,
    pub events_capacity: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            host: cli.host,
            port: cli.port,
            read_buffer_size: cli
                .read_buffer_size
                .unwrap_or(toml_config.buffers.read_size),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            backlog: toml_config.server.backlog,
            events_capacity: toml_config.server.events_capacity,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a relay bound to `host:port` with default tunables.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let toml_config = TomlConfig::default();
        Config {
            host: host.into(),
            port,
            read_buffer_size: toml_config.buffers.read_size,
            max_connections: toml_config.server.max_connections,
            backlog: toml_config.server.backlog,
            events_capacity: toml_config.server.events_capacity,
            log_level: toml_config.logging.level,
        }
    }

    /// Capacity of each connection's write buffer.
    pub fn write_buffer_size(&self) -> usize {
        self.read_buffer_size * WRITE_BUFFER_FACTOR
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read buffer size must be non-zero"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max connections must be non-zero"));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid("events capacity must be non-zero"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
