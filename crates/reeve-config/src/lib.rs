//! # Reeve configuration
//!
//! YAML/TOML/JSON configuration for the TCP proxy: listening frontends,
//! downstream backends, the client ACL, and the process-lifetime tuning
//! knobs of the TCP dataplane.
//!
//! All knobs are read once at startup; the dataplane never reloads them.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod backends;
pub mod frontends;

pub use backends::BackendConfig;
pub use frontends::{FrontendConfig, TlsConfig};

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("file not found: {0}")]
    NotFound(PathBuf),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP dataplane tuning.
    pub tcp: TcpConfig,

    /// Listening frontends.
    pub frontends: Vec<FrontendConfig>,

    /// Downstream backends.
    pub backends: Vec<BackendConfig>,

    /// Client networks allowed to connect. Empty means allow everyone.
    pub acl: Vec<ipnet::IpNet>,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp: TcpConfig::default(),
            frontends: vec![FrontendConfig::default()],
            backends: Vec::new(),
            acl: default_acl(),
            logging: LoggingConfig::default(),
        }
    }
}

/// The default ACL: loopback and RFC 1918 space.
fn default_acl() -> Vec<ipnet::IpNet> {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "::1/128",
        "fc00::/7",
    ]
    .iter()
    .map(|net| net.parse().expect("static networks parse"))
    .collect()
}

impl Config {
    /// Loads configuration from a file, dispatching on the extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };

        Ok(config)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.frontends.is_empty() {
            return Err(ConfigError::Validation(
                "at least one frontend is required".into(),
            ));
        }

        if self.backends.is_empty() {
            return Err(ConfigError::Validation(
                "at least one backend is required".into(),
            ));
        }

        if self.tcp.worker_threads == 0 {
            return Err(ConfigError::Validation(
                "tcp.worker_threads must be at least 1".into(),
            ));
        }

        for frontend in &self.frontends {
            frontend.validate()?;
        }

        for backend in &self.backends {
            backend.validate()?;
        }

        Ok(())
    }

    /// True when `addr` is allowed by the client ACL.
    pub fn acl_matches(&self, addr: IpAddr) -> bool {
        self.acl.is_empty() || self.acl.iter().any(|net| net.contains(&addr))
    }
}

/// TCP dataplane tuning knobs.
///
/// A value of 0 disables the corresponding limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Maximum connections accepted but not yet picked up by a worker.
    pub max_queued_connections: u64,

    /// Maximum queries served on one client connection.
    pub max_queries_per_conn: u64,

    /// Maximum lifetime of a client connection, in seconds.
    pub max_connection_duration: u64,

    /// Maximum simultaneous connections per client IP.
    pub max_connections_per_client: usize,

    /// Interval between idle-backend-connection sweeps, in seconds.
    pub downstream_cleanup_interval: u64,

    /// Share a single handoff pipe between all workers.
    pub single_pipe: bool,

    /// Maximum number of worker threads, added lazily.
    pub worker_threads: usize,

    /// Client read timeout, in seconds.
    pub read_timeout: u64,

    /// Client write timeout, in seconds.
    pub write_timeout: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_queued_connections: 1000,
            max_queries_per_conn: 0,
            max_connection_duration: 0,
            max_connections_per_client: 0,
            downstream_cleanup_interval: 60,
            single_pipe: false,
            worker_threads: 10,
            read_timeout: 2,
            write_timeout: 2,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Log format ("text" or "json").
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Default frontend listen address.
pub(crate) fn default_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 53)
}
