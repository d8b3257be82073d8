//! Frontend (listening endpoint) configuration.

use super::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// A listening endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Listen address.
    pub address: SocketAddr,

    /// TLS termination; plain TCP when absent.
    pub tls: Option<TlsConfig>,

    /// TCP backlog.
    pub backlog: u32,

    /// Maximum queries in flight on one client connection.
    pub max_in_flight_queries_per_conn: usize,

    /// Networks a PROXY protocol header is accepted from.
    ///
    /// Clients outside these networks talk plain DNS; clients inside them
    /// must send a PROXY v1/v2 header before the first message.
    pub proxy_protocol_from: Vec<ipnet::IpNet>,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            address: super::default_listen(),
            tls: None,
            backlog: 1024,
            max_in_flight_queries_per_conn: 1,
            proxy_protocol_from: Vec::new(),
        }
    }
}

impl FrontendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight_queries_per_conn == 0 {
            return Err(ConfigError::Validation(format!(
                "frontend {}: max_in_flight_queries_per_conn must be at least 1",
                self.address
            )));
        }

        if let Some(tls) = &self.tls {
            tls.validate()?;
        }

        Ok(())
    }

    /// True when PROXY protocol is expected from `addr`.
    pub fn expects_proxy_protocol_from(&self, addr: std::net::IpAddr) -> bool {
        self.proxy_protocol_from.iter().any(|net| net.contains(&addr))
    }
}

/// TLS termination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Certificate chain file (PEM).
    pub cert: PathBuf,

    /// Private key file (PEM).
    pub key: PathBuf,
}

impl TlsConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.cert.exists() {
            return Err(ConfigError::NotFound(self.cert.clone()));
        }

        if !self.key.exists() {
            return Err(ConfigError::NotFound(self.key.clone()));
        }

        Ok(())
    }
}
