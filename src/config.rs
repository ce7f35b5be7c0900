//! Configuration module for the mage-tower server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// How inbound bytes are split into commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Every receive is exactly one command.
    #[default]
    Buffer,
    /// Every `\n`-terminated line is one command.
    Line,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "mage-tower")]
#[command(author = "mage-tower authors")]
#[command(version = "0.1.0")]
#[command(about = "A concurrent text command server", long_about = None)]
pub struct ServerArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (e.g., 0.0.0.0)
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum bytes read from a client in one receive
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Maximum number of pending connections queued by the OS
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Close connections idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// How inbound bytes are split into commands
    #[arg(long, value_enum)]
    pub framing: Option<Framing>,

    /// Seed for spell selection (random per connection when unset)
    #[arg(long)]
    pub spell_seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub connection: ConnectionSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Idle timeout in seconds (0 = never)
    #[serde(default)]
    pub idle_timeout: u64,
    #[serde(default)]
    pub framing: Framing,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            idle_timeout: 0,
            framing: Framing::default(),
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Deserialize, Default)]
pub struct DispatchSection {
    pub spell_seed: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9999
}

fn default_backlog() -> u32 {
    5
}

fn default_buffer_size() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration. Immutable once the server starts.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
    pub backlog: u32,
    pub idle_timeout: Option<Duration>,
    pub framing: Framing,
    pub spell_seed: Option<u64>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::resolve(ServerArgs::default_args(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(ServerArgs::parse())
    }

    /// Resolve parsed CLI args against the TOML file they name, if any.
    pub fn from_args(cli: ServerArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::resolve(cli, toml_config);
        if config.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be greater than 0"));
        }
        Ok(config)
    }

    fn resolve(cli: ServerArgs, toml_config: TomlConfig) -> Self {
        let idle_secs = cli
            .idle_timeout
            .unwrap_or(toml_config.connection.idle_timeout);

        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.connection.buffer_size),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            framing: cli.framing.unwrap_or(toml_config.connection.framing),
            spell_seed: cli.spell_seed.or(toml_config.dispatch.spell_seed),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Resolve `host:port` into a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|_| ConfigError::InvalidAddress(addr))
    }
}

impl ServerArgs {
    fn default_args() -> Self {
        ServerArgs {
            config: None,
            host: None,
            port: None,
            buffer_size: None,
            backlog: None,
            idle_timeout: None,
            framing: None,
            spell_seed: None,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidAddress(String),
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
            ConfigError::InvalidAddress(addr) => {
                write!(f, "Invalid bind address '{addr}'")
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9999);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.backlog, 5);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.framing, Framing::Buffer);
        assert_eq!(config.spell_seed, None);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 4000
            backlog = 64

            [connection]
            buffer_size = 4096
            idle_timeout = 30
            framing = "line"

            [dispatch]
            spell_seed = 7

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.backlog, 64);
        assert_eq!(config.connection.buffer_size, 4096);
        assert_eq!(config.connection.idle_timeout, 30);
        assert_eq!(config.connection.framing, Framing::Line);
        assert_eq!(config.dispatch.spell_seed, Some(7));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 4000
            [connection]
            idle_timeout = 30
        "#,
        )
        .unwrap();
        let cli = ServerArgs::try_parse_from(["mage-tower", "--port", "5000", "--framing", "line"])
            .unwrap();

        let config = Config::resolve(cli, toml_config);
        assert_eq!(config.port, 5000);
        assert_eq!(config.framing, Framing::Line);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let cli = ServerArgs::try_parse_from(["mage-tower", "--buffer-size", "0"]).unwrap();
        assert!(matches!(
            Config::from_args(cli),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bind_addr() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        };
        assert_eq!(config.bind_addr().unwrap().ip().to_string(), "127.0.0.1");

        let config = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.bind_addr(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }
}
