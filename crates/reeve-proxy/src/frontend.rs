//! Listening endpoints and the acceptor.
//!
//! One acceptor task per frontend. Admission happens here, in order: ACL,
//! socket options, global queued-handoff cap, per-client-IP cap. Accepted
//! connections are handed to a worker over its pipe; a failed handoff
//! backs out every counter it took.

use crate::stats::FrontendStats;
use crate::stream::load_tls_config;
use crate::worker::WorkerSet;
use crate::proxy::ProxyShared;
use crate::Result;
use parking_lot::Mutex;
use reeve_config::FrontendConfig;
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// A listening endpoint: socket, optional TLS frontend, and counters.
pub struct Frontend {
    /// Endpoint configuration.
    pub config: FrontendConfig,

    /// TLS acceptor; `None` for plain TCP.
    pub tls: Option<TlsAcceptor>,

    /// Per-endpoint counters.
    pub stats: FrontendStats,

    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Frontend {
    /// Binds the listening socket and prepares TLS termination.
    pub async fn bind(config: FrontendConfig) -> Result<Self> {
        let tls = match &config.tls {
            Some(tls_config) => Some(TlsAcceptor::from(load_tls_config(
                &tls_config.cert,
                &tls_config.key,
            )?)),
            None => None,
        };

        let listener = bind_listener(config.address, config.backlog)?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            tls = tls.is_some(),
            "TCP frontend listening"
        );

        Ok(Self {
            config,
            tls,
            stats: FrontendStats::default(),
            listener,
            local_addr,
        })
    }

    /// The bound address (resolves port 0 to the real port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Creates the listening socket with the options the dataplane needs.
fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

/// Ownership bundle for one accepted client connection.
///
/// Moves from the acceptor to a worker over the handoff pipe; the guards
/// it carries undo the admission accounting when the connection ends, on
/// every path.
pub(crate) struct ConnectionInfo {
    /// The accepted socket, re-registered on the worker's reactor.
    pub stream: std::net::TcpStream,

    /// Remote address at accept time.
    pub peer: SocketAddr,

    /// The endpoint the connection arrived on.
    pub frontend: Arc<Frontend>,

    /// Slot in the per-client-IP table.
    pub client_guard: ClientCountGuard,

    /// Slot in the endpoint's current-connection gauge.
    pub conn_guard: CurrentConnectionGuard,
}

/// Keeps `tcp_current_connections` honest across all exit paths.
pub(crate) struct CurrentConnectionGuard {
    frontend: Arc<Frontend>,
}

impl CurrentConnectionGuard {
    pub(crate) fn new(frontend: Arc<Frontend>) -> Self {
        frontend
            .stats
            .tcp_current_connections
            .fetch_add(1, Ordering::Relaxed);
        Self { frontend }
    }
}

impl Drop for CurrentConnectionGuard {
    fn drop(&mut self) {
        self.frontend
            .stats
            .tcp_current_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Per-client-IP connection counter.
///
/// A coarse mutex is plenty: it is touched only at accept and close, both
/// orders of magnitude rarer than queries.
pub(crate) struct ClientCounter {
    max: usize,
    counts: Mutex<HashMap<IpAddr, usize>>,
}

impl ClientCounter {
    /// `max == 0` disables the cap.
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Takes a slot for `ip`, or refuses because the cap is reached.
    pub(crate) fn try_acquire(self: &Arc<Self>, ip: IpAddr) -> Option<ClientCountGuard> {
        if self.max == 0 {
            return Some(ClientCountGuard { slot: None });
        }

        let mut counts = self.counts.lock();
        let entry = counts.entry(ip).or_insert(0);
        if *entry >= self.max {
            return None;
        }
        *entry += 1;

        Some(ClientCountGuard {
            slot: Some((self.clone(), ip)),
        })
    }

    /// Current count for `ip`. Zero means the entry is absent.
    pub(crate) fn count(&self, ip: IpAddr) -> usize {
        self.counts.lock().get(&ip).copied().unwrap_or(0)
    }
}

/// Releases the per-client slot on drop; the entry disappears at zero.
pub(crate) struct ClientCountGuard {
    slot: Option<(Arc<ClientCounter>, IpAddr)>,
}

impl Drop for ClientCountGuard {
    fn drop(&mut self) {
        if let Some((counter, ip)) = self.slot.take() {
            let mut counts = counter.counts.lock();
            if let Some(entry) = counts.get_mut(&ip) {
                *entry = entry.saturating_sub(1);
                if *entry == 0 {
                    counts.remove(&ip);
                }
            }
        }
    }
}

/// Accepts connections on one frontend until shutdown.
pub(crate) async fn acceptor_loop(
    frontend: Arc<Frontend>,
    shared: Arc<ProxyShared>,
    workers: Arc<WorkerSet>,
) -> Result<()> {
    loop {
        let (socket, peer) = match frontend.listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(listener = %frontend.local_addr, error = %e, "accept failed");
                continue;
            }
        };

        let conn_guard = CurrentConnectionGuard::new(frontend.clone());

        if !shared.acl_matches(peer.ip()) {
            reeve_metrics::metrics().record_acl_drop();
            debug!(client = %peer, "dropping TCP connection: ACL");
            continue;
        }

        let _ = socket.set_nodelay(true);

        if shared.max_queued_connections > 0
            && shared.queued.load(Ordering::Relaxed) >= shared.max_queued_connections
        {
            debug!(client = %peer, "dropping TCP connection: too many queued already");
            continue;
        }

        let client_guard = match shared.client_counter.try_acquire(peer.ip()) {
            Some(guard) => guard,
            None => {
                debug!(client = %peer, "dropping TCP connection: per-client cap reached");
                continue;
            }
        };

        let stream = match socket.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                debug!(client = %peer, error = %e, "failed to detach accepted socket");
                continue;
            }
        };

        debug!(client = %peer, listener = %frontend.local_addr, "accepted TCP connection");

        shared.queued.fetch_add(1, Ordering::Relaxed);
        let info = ConnectionInfo {
            stream,
            peer,
            frontend: frontend.clone(),
            client_guard,
            conn_guard,
        };

        if workers.hand_off(info).is_err() {
            // Both counters come back: queued here, the per-client slot and
            // connection gauge via the dropped guards.
            shared.queued.fetch_sub(1, Ordering::Relaxed);
            debug!(client = %peer, "worker handoff failed, closing connection");
        }
    }
}
