//! Server configuration.
//!
//! Values come from command-line arguments layered over an optional TOML
//! file; the command line wins wherever both supply a value. A missing
//! port means the host field names a unix-domain socket path.

use crate::socket::BindTarget;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Command-line arguments for the server binary.
#[derive(Parser, Debug)]
#[command(name = "mooring")]
#[command(version = "0.1.0")]
#[command(about = "A pre-fork socket server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind (empty = all interfaces), or a socket path when no
    /// port is given
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on; omit to serve a unix-domain socket at `host`
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog depth
    #[arg(short, long)]
    pub backlog: Option<i32>,

    /// Worker processes: N, 0 for one per core, -K to reserve K cores
    #[arg(short, long)]
    pub fork: Option<i32>,

    /// Protocol to serve
    #[arg(long, value_enum)]
    pub protocol: Option<ProtocolKind>,

    /// Free-form protocol option, KEY=VALUE (repeatable)
    #[arg(short = 'o', long = "option", value_parser = parse_key_val)]
    pub options: Vec<(String, String)>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

/// Bundled protocols selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Echo,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub host: String,
    pub port: Option<u16>,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    pub fork: Option<i32>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: None,
            backlog: default_backlog(),
            fork: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ProtocolSection {
    pub kind: Option<ProtocolKind>,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

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

fn default_backlog() -> i32 {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration. Immutable once the server is built;
/// the fork count is resolved to a concrete worker count at start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: Option<u16>,
    pub backlog: i32,
    pub fork: Option<i32>,
    pub protocol: ProtocolKind,
    pub options: HashMap<String, String>,
    pub log_level: String,
}

impl ServerConfig {
    /// A TCP endpoint with library defaults.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ServerConfig {
            host: host.into(),
            port: Some(port),
            backlog: default_backlog(),
            fork: Some(1),
            protocol: ProtocolKind::Echo,
            options: HashMap::new(),
            log_level: default_log_level(),
        }
    }

    /// A unix-domain socket endpoint with library defaults.
    pub fn unix(path: impl Into<String>) -> Self {
        ServerConfig {
            host: path.into(),
            port: None,
            backlog: default_backlog(),
            fork: Some(1),
            protocol: ProtocolKind::Echo,
            options: HashMap::new(),
            log_level: default_log_level(),
        }
    }

    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut options = toml_config.protocol.options;
        for (key, value) in cli.options {
            options.insert(key, value);
        }

        Ok(ServerConfig {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            fork: cli.fork.or(toml_config.server.fork),
            protocol: cli
                .protocol
                .or(toml_config.protocol.kind)
                .unwrap_or(ProtocolKind::Echo),
            options,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    pub(crate) fn bind_target(&self) -> BindTarget {
        match self.port {
            Some(port) => BindTarget::Tcp {
                host: self.host.clone(),
                port,
            },
            None => BindTarget::Unix {
                path: PathBuf::from(&self.host),
            },
        }
    }

    pub(crate) fn is_tcp(&self) -> bool {
        self.port.is_some()
    }
}

/// Configuration loading errors.
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
