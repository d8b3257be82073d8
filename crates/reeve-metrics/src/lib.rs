//! # Reeve metrics
//!
//! Process-wide dataplane counters plus structured-logging setup. The
//! counters are plain atomics so the hot path never allocates; the
//! `metrics` facade is fed alongside for whatever exporter the embedding
//! process installs.

use metrics::counter;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub mod tracing_setup;

/// Global metrics instance.
static METRICS: OnceCell<ProxyMetrics> = OnceCell::new();

/// Gets or initializes the global metrics instance.
pub fn metrics() -> &'static ProxyMetrics {
    METRICS.get_or_init(ProxyMetrics::new)
}

/// Process-wide dataplane counters.
///
/// Per-frontend and per-backend tallies live with their owners; these are
/// the cross-cutting totals.
#[derive(Debug)]
pub struct ProxyMetrics {
    start_time: Instant,

    /// Queries accepted for processing.
    pub queries: AtomicU64,

    /// Responses relayed to clients.
    pub responses: AtomicU64,

    /// Responses that left the frontend with NOERROR.
    pub frontend_noerror: AtomicU64,

    /// Responses that left the frontend with NXDOMAIN.
    pub frontend_nxdomain: AtomicU64,

    /// Responses that left the frontend with SERVFAIL.
    pub frontend_servfail: AtomicU64,

    /// SERVFAIL responses from any origin.
    pub servfail_responses: AtomicU64,

    /// Queries rejected before dispatch (undersized, malformed header).
    pub non_compliant_queries: AtomicU64,

    /// Connections dropped by the client ACL.
    pub acl_drops: AtomicU64,

    /// PROXY protocol headers that failed to parse.
    pub proxy_protocol_invalid: AtomicU64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            queries: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            frontend_noerror: AtomicU64::new(0),
            frontend_nxdomain: AtomicU64::new(0),
            frontend_servfail: AtomicU64::new(0),
            servfail_responses: AtomicU64::new(0),
            non_compliant_queries: AtomicU64::new(0),
            acl_drops: AtomicU64::new(0),
            proxy_protocol_invalid: AtomicU64::new(0),
        }
    }

    /// Returns the process uptime.
    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Records a query accepted for processing.
    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        counter!("dns_tcp_queries_total").increment(1);
    }

    /// Records a response relayed to a client.
    pub fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
        counter!("dns_tcp_responses_total").increment(1);
    }

    /// Records the rcode of a response written to a client.
    pub fn record_frontend_rcode(&self, rcode: Option<u8>) {
        match rcode {
            Some(0) => {
                self.frontend_noerror.fetch_add(1, Ordering::Relaxed);
            }
            Some(2) => {
                self.frontend_servfail.fetch_add(1, Ordering::Relaxed);
                self.servfail_responses.fetch_add(1, Ordering::Relaxed);
            }
            Some(3) => {
                self.frontend_nxdomain.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Records a query rejected before dispatch.
    pub fn record_non_compliant(&self) {
        self.non_compliant_queries.fetch_add(1, Ordering::Relaxed);
        counter!("dns_tcp_non_compliant_total").increment(1);
    }

    /// Records a connection dropped by the ACL.
    pub fn record_acl_drop(&self) {
        self.acl_drops.fetch_add(1, Ordering::Relaxed);
        counter!("dns_tcp_acl_drops_total").increment(1);
    }

    /// Records an invalid PROXY protocol header.
    pub fn record_proxy_protocol_invalid(&self) {
        self.proxy_protocol_invalid.fetch_add(1, Ordering::Relaxed);
        counter!("dns_tcp_proxy_protocol_invalid_total").increment(1);
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}
