//! Worker threads and the acceptor→worker handoff.
//!
//! Each worker is an OS thread driving a single-threaded runtime with a
//! `LocalSet`, so everything it owns — connection tasks, backend
//! transports, the idle-connection pool — stays on that thread. Workers
//! are added lazily as connections arrive, up to the configured maximum,
//! then handoffs round-robin across them.

use crate::connection;
use crate::frontend::ConnectionInfo;
use crate::pool::DownstreamPool;
use crate::proxy::ProxyShared;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Where a worker gets its connections from.
enum WorkerSource {
    /// This worker's own pipe.
    Own(mpsc::UnboundedReceiver<ConnectionInfo>),

    /// The single pipe shared by every worker. Whichever worker is free
    /// takes the next connection.
    Shared(Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ConnectionInfo>>>),
}

impl WorkerSource {
    async fn recv(&mut self) -> Option<ConnectionInfo> {
        match self {
            Self::Own(rx) => rx.recv().await,
            Self::Shared(shared) => shared.lock().await.recv().await,
        }
    }
}

type SharedPipe = (
    mpsc::UnboundedSender<ConnectionInfo>,
    Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ConnectionInfo>>>,
);

/// The collection of worker threads and their pipes.
pub(crate) struct WorkerSet {
    shared: Arc<ProxyShared>,
    max_workers: usize,
    single_pipe: bool,
    inner: Mutex<WorkerSetInner>,
}

#[derive(Default)]
struct WorkerSetInner {
    senders: Vec<mpsc::UnboundedSender<ConnectionInfo>>,
    shared_pipe: Option<SharedPipe>,
    spawned: usize,
    next: usize,
}

impl WorkerSet {
    pub(crate) fn new(shared: Arc<ProxyShared>, max_workers: usize, single_pipe: bool) -> Arc<Self> {
        Arc::new(Self {
            shared,
            max_workers,
            single_pipe,
            inner: Mutex::new(WorkerSetInner::default()),
        })
    }

    /// Transfers ownership of one accepted connection to a worker.
    pub(crate) fn hand_off(
        &self,
        info: ConnectionInfo,
    ) -> std::result::Result<(), Box<ConnectionInfo>> {
        let mut inner = self.inner.lock();

        if self.single_pipe {
            if inner.shared_pipe.is_none() {
                let (tx, rx) = mpsc::unbounded_channel();
                inner.shared_pipe = Some((tx, Arc::new(tokio::sync::Mutex::new(rx))));
            }
            let (tx, rx) = match &inner.shared_pipe {
                Some((tx, rx)) => (tx.clone(), rx.clone()),
                None => return Err(Box::new(info)),
            };

            if inner.spawned < self.max_workers {
                spawn_worker(inner.spawned, WorkerSource::Shared(rx), self.shared.clone());
                inner.spawned += 1;
            }

            return tx.send(info).map_err(|e| Box::new(e.0));
        }

        // Grow the pool lazily; once full, round-robin.
        if inner.spawned < self.max_workers {
            let (tx, rx) = mpsc::unbounded_channel();
            spawn_worker(inner.spawned, WorkerSource::Own(rx), self.shared.clone());
            inner.spawned += 1;
            let result = tx.send(info).map_err(|e| Box::new(e.0));
            inner.senders.push(tx);
            return result;
        }

        if inner.senders.is_empty() {
            return Err(Box::new(info));
        }

        let idx = inner.next % inner.senders.len();
        inner.next = inner.next.wrapping_add(1);
        inner.senders[idx].send(info).map_err(|e| Box::new(e.0))
    }

    /// Number of worker threads started so far.
    pub(crate) fn worker_count(&self) -> usize {
        self.inner.lock().spawned
    }
}

/// Starts one worker thread.
fn spawn_worker(id: usize, source: WorkerSource, shared: Arc<ProxyShared>) {
    debug!(worker = id, "starting TCP worker thread");

    let spawned = std::thread::Builder::new()
        .name(format!("reeve-tcp-{id}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(worker = id, error = %e, "failed to build worker runtime");
                    return;
                }
            };

            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, worker_main(source, shared));
        });

    if let Err(e) = spawned {
        error!(worker = id, error = %e, "failed to spawn worker thread");
    }
}

/// The worker event loop: connection handoffs plus the periodic sweep of
/// the idle backend-connection pool.
async fn worker_main(mut source: WorkerSource, shared: Arc<ProxyShared>) {
    let pool = Rc::new(RefCell::new(DownstreamPool::new()));

    let sweep_enabled = shared.downstream_cleanup_interval.is_some();
    let period = shared
        .downstream_cleanup_interval
        .unwrap_or(Duration::from_secs(3600));
    let mut cleanup = tokio::time::interval(period);
    cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            info = source.recv() => match info {
                Some(info) => {
                    shared.queued.fetch_sub(1, Ordering::Relaxed);
                    tokio::task::spawn_local(connection::run(
                        info,
                        pool.clone(),
                        shared.clone(),
                    ));
                }
                None => break,
            },

            _ = cleanup.tick() => {
                if sweep_enabled {
                    pool.borrow_mut().sweep();
                }
            }
        }
    }

    debug!("TCP worker shutting down");
}
