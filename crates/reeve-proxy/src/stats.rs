//! Per-frontend counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one listening endpoint.
///
/// Shared and read-mostly; every field is updated from the dataplane with
/// relaxed atomics.
#[derive(Debug, Default)]
pub struct FrontendStats {
    /// Queries read off client connections.
    pub queries: AtomicU64,

    /// Responses written back to clients.
    pub responses: AtomicU64,

    /// Currently open client connections.
    pub tcp_current_connections: AtomicU64,

    /// Connections that died while reading a query.
    pub tcp_died_reading_query: AtomicU64,

    /// Connections that died while writing a response.
    pub tcp_died_sending_response: AtomicU64,

    /// Client-side I/O timeouts that closed a connection.
    pub tcp_client_timeouts: AtomicU64,

    /// Backend timeouts observed on behalf of this frontend's clients.
    pub tcp_downstream_timeouts: AtomicU64,

    /// Backend connections given up after exhausting retries.
    pub tcp_gave_up: AtomicU64,

    /// Connections negotiated with TLS 1.2.
    pub tls12_connections: AtomicU64,

    /// Connections negotiated with TLS 1.3.
    pub tls13_connections: AtomicU64,

    /// Connections negotiated with another TLS version.
    pub tls_unknown_connections: AtomicU64,

    /// Full TLS handshakes.
    pub tls_new_sessions: AtomicU64,

    /// Resumed TLS sessions.
    pub tls_resumptions: AtomicU64,

    /// EWMA of queries per connection, f64 bits.
    tcp_avg_queries_per_connection: AtomicU64,

    /// EWMA of connection duration in milliseconds, f64 bits.
    tcp_avg_connection_duration: AtomicU64,
}

/// Smoothing factor for the per-connection EWMAs.
const EWMA_ALPHA: f64 = 0.125;

impl FrontendStats {
    /// Folds one finished connection into the per-connection EWMAs.
    pub fn update_tcp_metrics(&self, queries: u64, duration_ms: f64) {
        Self::ewma(&self.tcp_avg_queries_per_connection, queries as f64);
        Self::ewma(&self.tcp_avg_connection_duration, duration_ms);
    }

    /// EWMA of queries per connection.
    pub fn avg_queries_per_connection(&self) -> f64 {
        f64::from_bits(self.tcp_avg_queries_per_connection.load(Ordering::Relaxed))
    }

    /// EWMA of connection duration, in milliseconds.
    pub fn avg_connection_duration(&self) -> f64 {
        f64::from_bits(self.tcp_avg_connection_duration.load(Ordering::Relaxed))
    }

    fn ewma(cell: &AtomicU64, sample: f64) {
        let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            let old = f64::from_bits(bits);
            let new = if old == 0.0 {
                sample
            } else {
                old + EWMA_ALPHA * (sample - old)
            };
            Some(new.to_bits())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_converges_toward_samples() {
        let stats = FrontendStats::default();
        stats.update_tcp_metrics(10, 100.0);
        assert_eq!(stats.avg_queries_per_connection(), 10.0);

        for _ in 0..200 {
            stats.update_tcp_metrics(2, 20.0);
        }
        assert!((stats.avg_queries_per_connection() - 2.0).abs() < 0.1);
        assert!((stats.avg_connection_duration() - 20.0).abs() < 1.0);
    }
}
