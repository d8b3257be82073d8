//! Backend (downstream server) configuration.

use super::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// A downstream DNS server queries are forwarded to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Human-readable name, used in logs.
    pub name: String,

    /// Server address.
    pub address: SocketAddr,

    /// Prepend a PROXY protocol v2 payload on each fresh connection.
    pub use_proxy_protocol: bool,

    /// Connect timeout, in seconds.
    pub connect_timeout: u64,

    /// Read timeout for responses, in seconds.
    pub read_timeout: u64,

    /// Write timeout for queries, in seconds.
    pub write_timeout: u64,

    /// Reconnect attempts before giving up on in-flight queries.
    pub retries: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53),
            use_proxy_protocol: false,
            connect_timeout: 5,
            read_timeout: 30,
            write_timeout: 2,
            retries: 5,
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout == 0 {
            return Err(ConfigError::Validation(format!(
                "backend {}: connect_timeout must be at least 1 second",
                self.address
            )));
        }

        Ok(())
    }

    /// The name used in logs, falling back to the address.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.address.to_string()
        } else {
            self.name.clone()
        }
    }
}
