//! # Reeve TCP dataplane
//!
//! The stream side of the proxy: accepts DNS-over-TCP (optionally TLS)
//! connections, reads length-framed queries, runs them through the
//! configured [`policy::QueryPolicy`], forwards them over pooled backend
//! connections, and relays responses back in arrival order.
//!
//! ## Architecture
//!
//! - **Acceptors** run on the caller's runtime, one per frontend. They
//!   enforce admission (ACL, queued cap, per-client cap) and hand accepted
//!   sockets to workers over pipes.
//! - **Workers** are dedicated threads, each driving a single-threaded
//!   event loop. Everything a worker touches on the fast path — connection
//!   state, backend connections, the idle-connection pool — is local to
//!   that worker.
//! - **Client connections** are pipelined: several queries may be in
//!   flight at once, and responses are written back in the order they
//!   arrive, not the order the queries were read.
//! - **Backend connections** multiplex the in-flight queries of one client
//!   and are returned to a worker-local pool when idle, keyed by backend
//!   and bound to the PROXY TLV set they first carried.

use reeve_proto::Name;
use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;

pub mod backend;
pub mod frontend;
pub mod policy;
pub mod proxy;
pub mod proxy_protocol;
pub mod stats;
pub mod stream;

pub(crate) mod connection;
pub(crate) mod pool;
pub(crate) mod worker;

pub use backend::Backend;
pub use frontend::Frontend;
pub use policy::{QueryContext, QueryPolicy, Verdict};
pub use proxy::ProxyServer;
pub use proxy_protocol::{ProxyHeader, ProxyTlv};
pub use stats::FrontendStats;

/// Dataplane error types.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("protocol error: {0}")]
    Proto(#[from] reeve_proto::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("shutdown in progress")]
    Shutdown,
}

/// Result type for dataplane operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Bookkeeping for one in-flight query.
///
/// Moves into the backend connection when the query is submitted and moves
/// back with the response.
#[derive(Debug, Clone)]
pub struct IdState {
    /// Query id as the client sent it.
    pub id: u16,

    /// Question name.
    pub qname: Name,

    /// Question type, raw.
    pub qtype: u16,

    /// Question class, raw.
    pub qclass: u16,

    /// When the query was submitted to the backend.
    pub sent_at: Instant,

    /// The client the query originated from (post-PROXY address).
    pub origin: SocketAddr,

    /// True when the cache layer was bypassed for this query.
    pub cache_skipped: bool,
}
