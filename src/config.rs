//! Configuration module for line-relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. The listening
//! address is always loopback; only the port is caller-supplied.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "line-relay")]
#[command(author = "line-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "Relays every line a client sends to all other clients", long_about = None)]
pub struct CliArgs {
    /// TCP port to listen on (loopback only)
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// What to do when reading from a client fails
    #[arg(long, value_enum)]
    pub read_errors: Option<ReadErrorPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Reaction to a failed read on a client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReadErrorPolicy {
    /// Stop the whole relay.
    #[default]
    Fatal,
    /// Drop only the failing client and announce its departure.
    Disconnect,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Pending connection queue length passed to `listen`
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Size of the receive buffer used for each read
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
    /// Maximum readiness events handled per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    /// Reaction to client read failures
    #[serde(default)]
    pub read_errors: ReadErrorPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            recv_buffer_size: default_recv_buffer_size(),
            events_capacity: default_events_capacity(),
            read_errors: ReadErrorPolicy::default(),
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

fn default_backlog() -> i32 {
    10
}

fn default_recv_buffer_size() -> usize {
    42 * 4096 // 168 KB
}

fn default_events_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backlog: i32,
    pub recv_buffer_size: usize,
    pub events_capacity: usize,
    pub read_errors: ReadErrorPolicy,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    ///
    /// A wrong argument count exits the process with a usage message before
    /// anything else happens.
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

        Ok(Config::merge(cli, toml_config))
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            port: cli.port,
            backlog: toml_config.server.backlog,
            recv_buffer_size: toml_config.server.recv_buffer_size.max(1),
            events_capacity: toml_config.server.events_capacity.max(1),
            read_errors: cli
                .read_errors
                .unwrap_or(toml_config.server.read_errors),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Loopback address to bind.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
