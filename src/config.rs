//! Configuration module for the line relay.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::error::ErrorKind;
use clap::Parser;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::PathBuf;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "line-relay")]
#[command(version = "0.1.0")]
#[command(about = "Broadcasts every received line to all other connected clients", long_about = None)]
pub struct CliArgs {
    /// TCP port to listen on
    #[arg(value_name = "PORT")]
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

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
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Pending connection queue length passed to listen(2)
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Bytes requested per read on a client socket
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    /// Longest accepted inbound line in bytes (0 = unbounded)
    #[serde(default)]
    pub max_line_len: usize,
    /// Readiness events drained per wait
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Reads taken from one client before the loop moves on to the next
    #[serde(default = "default_reads_per_turn")]
    pub reads_per_turn: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            backlog: default_backlog(),
            read_chunk_size: default_read_chunk_size(),
            max_line_len: 0,
            event_capacity: default_event_capacity(),
            reads_per_turn: default_reads_per_turn(),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backlog() -> i32 {
    100
}

fn default_read_chunk_size() -> usize {
    1024
}

fn default_event_capacity() -> usize {
    1024
}

fn default_reads_per_turn() -> usize {
    16
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub read_chunk_size: usize,
    pub max_line_len: usize,
    pub event_capacity: usize,
    pub reads_per_turn: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(std::env::args_os())
    }

    /// Load configuration from an explicit argument list.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let cli = CliArgs::try_parse_from(args)?;

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port,
            backlog: toml_config.server.backlog,
            read_chunk_size: toml_config.server.read_chunk_size.max(1),
            max_line_len: toml_config.server.max_line_len,
            event_capacity: toml_config.server.event_capacity.max(1),
            reads_per_turn: toml_config.server.reads_per_turn.max(1),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Args(#[from] clap::Error),

    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1.message())]
    TomlParse(PathBuf, #[source] toml::de::Error),
}

impl ConfigError {
    /// Whether this is a help or version request rather than a fault.
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            ConfigError::Args(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion)
        )
    }

    /// Single-line operator diagnostic for the error stream.
    pub fn diagnostic(&self) -> String {
        match self {
            ConfigError::Args(e) => match e.kind() {
                ErrorKind::MissingRequiredArgument
                | ErrorKind::UnknownArgument
                | ErrorKind::TooManyValues
                | ErrorKind::TooFewValues
                | ErrorKind::WrongNumberOfValues
                | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                    "Wrong number of arguments".to_string()
                }
                _ => "Fatal error".to_string(),
            },
            other => other.to_string(),
        }
    }
}
