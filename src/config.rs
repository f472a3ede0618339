//! Configuration for the turnstile server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

use crate::client::ClientType;

/// How freshly accepted connections are assigned to event-loop threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchPolicy {
    /// The accepting thread keeps the connection.
    #[default]
    Local,
    /// Hand each connection to a uniformly random non-main thread.
    /// Exercises the cross-thread paths; intended for testing.
    Random,
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "turnstile")]
#[command(version)]
#[command(about = "A multi-threaded RESP2/RESP3 server core", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:6379)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Unix domain socket path
    #[arg(long)]
    pub unixsocket: Option<PathBuf>,

    /// Number of event-loop threads (defaults to number of CPU cores)
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Maximum number of simultaneous clients
    #[arg(long)]
    pub maxclients: Option<usize>,

    /// Password required from clients (disables protected-mode refusals)
    #[arg(long)]
    pub requirepass: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Connection dispatch policy (local or random)
    #[arg(long, value_enum, default_value = "local")]
    pub dispatch: DispatchPolicy,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub unixsocket: Option<PathBuf>,
    pub threads: Option<usize>,
    #[serde(default = "default_true")]
    pub protected_mode: bool,
    pub requirepass: Option<String>,
    /// TCP keepalive interval in seconds; 0 disables it.
    #[serde(default = "default_keepalive")]
    pub tcp_keepalive: u64,
    /// Pin accepted sockets to their owner thread's CPU (Linux only).
    #[serde(default)]
    pub thread_affinity: bool,
    /// Post writable events with a barrier, as required when every write
    /// is fsynced.
    #[serde(default)]
    pub fsync_always: bool,
    #[serde(default)]
    pub dispatch: DispatchPolicy,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            unixsocket: None,
            threads: None,
            protected_mode: true,
            requirepass: None,
            tcp_keepalive: default_keepalive(),
            thread_affinity: false,
            fsync_always: false,
            dispatch: DispatchPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_maxclients")]
    pub maxclients: usize,
    #[serde(default = "default_max_querybuf")]
    pub client_max_querybuf_len: usize,
    #[serde(default = "default_max_bulk")]
    pub proto_max_bulk_len: usize,
    #[serde(default)]
    pub obuf_normal: OutputBufferLimit,
    #[serde(default = "default_obuf_replica")]
    pub obuf_replica: OutputBufferLimit,
    #[serde(default = "default_obuf_pubsub")]
    pub obuf_pubsub: OutputBufferLimit,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            maxclients: default_maxclients(),
            client_max_querybuf_len: default_max_querybuf(),
            proto_max_bulk_len: default_max_bulk(),
            obuf_normal: OutputBufferLimit::default(),
            obuf_replica: default_obuf_replica(),
            obuf_pubsub: default_obuf_pubsub(),
        }
    }
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

/// Per-class output buffer limit: hard cut, and a soft cut that must be
/// exceeded continuously for `soft_seconds`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct OutputBufferLimit {
    #[serde(default)]
    pub hard_bytes: usize,
    #[serde(default)]
    pub soft_bytes: usize,
    #[serde(default)]
    pub soft_seconds: u64,
}

fn default_listen() -> String {
    "127.0.0.1:6379".to_string()
}

fn default_true() -> bool {
    true
}

fn default_keepalive() -> u64 {
    300
}

fn default_maxclients() -> usize {
    10000
}

fn default_max_querybuf() -> usize {
    1024 * 1024 * 1024
}

fn default_max_bulk() -> usize {
    512 * 1024 * 1024
}

fn default_obuf_replica() -> OutputBufferLimit {
    OutputBufferLimit {
        hard_bytes: 256 * 1024 * 1024,
        soft_bytes: 64 * 1024 * 1024,
        soft_seconds: 60,
    }
}

fn default_obuf_pubsub() -> OutputBufferLimit {
    OutputBufferLimit {
        hard_bytes: 32 * 1024 * 1024,
        soft_bytes: 8 * 1024 * 1024,
        soft_seconds: 60,
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub unixsocket: Option<PathBuf>,
    pub threads: usize,
    pub maxclients: usize,
    pub client_max_querybuf_len: usize,
    pub proto_max_bulk_len: usize,
    pub tcp_keepalive: u64,
    pub protected_mode: bool,
    pub requirepass: Option<String>,
    pub thread_affinity: bool,
    pub fsync_always: bool,
    pub dispatch: DispatchPolicy,
    pub log_level: String,
    pub obuf_normal: OutputBufferLimit,
    pub obuf_replica: OutputBufferLimit,
    pub obuf_pubsub: OutputBufferLimit,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Config::from_cli(cli)
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let (host, port) = parse_listen_address(&listen)?;

        Ok(Config {
            host,
            port,
            unixsocket: cli.unixsocket.or(toml_config.server.unixsocket),
            threads: cli.threads.or(toml_config.server.threads).unwrap_or(0),
            maxclients: cli.maxclients.unwrap_or(toml_config.limits.maxclients),
            client_max_querybuf_len: toml_config.limits.client_max_querybuf_len,
            proto_max_bulk_len: toml_config.limits.proto_max_bulk_len,
            tcp_keepalive: toml_config.server.tcp_keepalive,
            protected_mode: toml_config.server.protected_mode,
            requirepass: cli.requirepass.or(toml_config.server.requirepass),
            thread_affinity: toml_config.server.thread_affinity,
            fsync_always: toml_config.server.fsync_always,
            dispatch: if cli.dispatch != DispatchPolicy::default() {
                cli.dispatch
            } else {
                toml_config.server.dispatch
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
            obuf_normal: toml_config.limits.obuf_normal,
            obuf_replica: toml_config.limits.obuf_replica,
            obuf_pubsub: toml_config.limits.obuf_pubsub,
        })
    }

    /// Effective event-loop thread count.
    pub fn effective_threads(&self) -> usize {
        if self.threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            self.threads
        }
    }

    /// Output buffer limits for a client class. Masters are limited like
    /// normal clients.
    pub fn obuf_limit(&self, class: ClientType) -> &OutputBufferLimit {
        match class {
            ClientType::Normal | ClientType::Master => &self.obuf_normal,
            ClientType::Replica => &self.obuf_replica,
            ClientType::PubSub => &self.obuf_pubsub,
        }
    }

    /// A small fixed configuration for unit tests.
    pub fn for_tests() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            unixsocket: None,
            threads: 1,
            maxclients: 100,
            client_max_querybuf_len: default_max_querybuf(),
            proto_max_bulk_len: default_max_bulk(),
            tcp_keepalive: 0,
            protected_mode: false,
            requirepass: None,
            thread_affinity: false,
            fsync_always: false,
            dispatch: DispatchPolicy::Local,
            log_level: "warn".to_string(),
            obuf_normal: OutputBufferLimit::default(),
            obuf_replica: default_obuf_replica(),
            obuf_pubsub: default_obuf_pubsub(),
        }
    }
}

fn parse_listen_address(addr: &str) -> Result<(String, u16), ConfigError> {
    if let Some((host, port_str)) = addr.rsplit_once(':') {
        let port = port_str
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;
        Ok((host.to_string(), port))
    } else {
        Err(ConfigError::InvalidAddress(addr.to_string()))
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidAddress(String),
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
                write!(f, "Invalid listen address '{addr}': expected host:port")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
