//! Proxy assembly: frontends, backends, workers, and shutdown.

use crate::backend::Backend;
use crate::frontend::{acceptor_loop, ClientCounter, Frontend};
use crate::policy::{ForwardAll, QueryPolicy};
use crate::worker::WorkerSet;
use crate::{ProxyError, Result};
use reeve_config::Config;
use std::net::IpAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

/// State shared by acceptors, workers, and connections.
pub(crate) struct ProxyShared {
    /// The query-processing oracle.
    pub policy: Arc<dyn QueryPolicy>,

    /// Client networks allowed to connect; empty allows everyone.
    pub acl: Vec<ipnet::IpNet>,

    /// Admission cap on accepted-but-not-yet-picked-up connections.
    pub max_queued_connections: u64,

    /// Per-connection query budget; 0 is unlimited.
    pub max_queries_per_conn: u64,

    /// Per-connection lifetime budget.
    pub max_connection_duration: Option<Duration>,

    /// Idle backend-connection sweep period; `None` disables the sweep.
    pub downstream_cleanup_interval: Option<Duration>,

    /// Client read deadline.
    pub read_timeout: Duration,

    /// Client write deadline.
    pub write_timeout: Duration,

    /// Connections handed off but not yet received by a worker.
    pub queued: AtomicU64,

    /// The per-client-IP connection table.
    pub client_counter: Arc<ClientCounter>,
}

impl ProxyShared {
    pub(crate) fn acl_matches(&self, addr: IpAddr) -> bool {
        self.acl.is_empty() || self.acl.iter().any(|net| net.contains(&addr))
    }
}

/// The assembled TCP dataplane.
pub struct ProxyServer {
    frontends: Vec<Arc<Frontend>>,
    backends: Vec<Arc<Backend>>,
    shared: Arc<ProxyShared>,
    workers: Arc<WorkerSet>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyServer {
    /// Binds all frontends and prepares workers, with an explicit policy
    /// and backend set.
    pub async fn new(
        config: &Config,
        backends: Vec<Arc<Backend>>,
        policy: Arc<dyn QueryPolicy>,
    ) -> Result<Self> {
        let mut frontends = Vec::with_capacity(config.frontends.len());
        for frontend_config in &config.frontends {
            frontends.push(Arc::new(Frontend::bind(frontend_config.clone()).await?));
        }

        if frontends.is_empty() {
            return Err(ProxyError::Config("no frontends configured".into()));
        }

        let tcp = &config.tcp;
        let shared = Arc::new(ProxyShared {
            policy,
            acl: config.acl.clone(),
            max_queued_connections: tcp.max_queued_connections,
            max_queries_per_conn: tcp.max_queries_per_conn,
            max_connection_duration: nonzero_secs(tcp.max_connection_duration),
            downstream_cleanup_interval: nonzero_secs(tcp.downstream_cleanup_interval),
            read_timeout: Duration::from_secs(tcp.read_timeout.max(1)),
            write_timeout: Duration::from_secs(tcp.write_timeout.max(1)),
            queued: AtomicU64::new(0),
            client_counter: Arc::new(ClientCounter::new(tcp.max_connections_per_client)),
        });

        let workers = WorkerSet::new(shared.clone(), tcp.worker_threads, tcp.single_pipe);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            frontends,
            backends,
            shared,
            workers,
            shutdown_tx,
        })
    }

    /// Convenience constructor: backends from the config, queries forwarded
    /// round-robin across them.
    pub async fn forwarding(config: &Config) -> Result<Self> {
        let backends: Vec<Arc<Backend>> = config
            .backends
            .iter()
            .map(|b| Arc::new(Backend::from_config(b)))
            .collect();
        let policy = Arc::new(ForwardAll::new(backends.clone()));
        Self::new(config, backends, policy).await
    }

    /// Runs every acceptor until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut handles = Vec::with_capacity(self.frontends.len());

        for frontend in &self.frontends {
            let frontend = frontend.clone();
            let shared = self.shared.clone();
            let workers = self.workers.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            handles.push(tokio::spawn(async move {
                tokio::select! {
                    result = acceptor_loop(frontend, shared, workers) => result,
                    _ = shutdown_rx.recv() => Ok(()),
                }
            }));
        }

        info!(
            frontends = self.frontends.len(),
            backends = self.backends.len(),
            "TCP proxy running"
        );

        for handle in handles {
            handle
                .await
                .map_err(|e| ProxyError::Io(std::io::Error::other(e)))??;
        }

        Ok(())
    }

    /// Initiates shutdown; `run` returns once the acceptors stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// The bound frontends, for stats inspection.
    pub fn frontends(&self) -> &[Arc<Frontend>] {
        &self.frontends
    }

    /// The configured backends, for stats inspection.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Number of worker threads started so far.
    pub fn worker_count(&self) -> usize {
        self.workers.worker_count()
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
