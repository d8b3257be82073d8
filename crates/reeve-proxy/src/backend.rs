//! Backend servers and pooled connections to them.
//!
//! A [`BackendConn`] multiplexes the in-flight queries of one client
//! connection over a single TCP stream to a downstream server. The socket
//! is owned by a worker-local transport task; the client side holds a
//! cheap cloneable handle. Responses are matched to queries by DNS id and
//! routed back to the submitting client through the reply channel each
//! query carries.
//!
//! A connection that goes idle and is still trustworthy is parked in the
//! worker's [`crate::pool::DownstreamPool`] for reuse. Once a PROXY
//! protocol TLV set has been sent on a connection, that set becomes the
//! connection's identity: it may only ever be reused for clients offering
//! the same TLVs, and it never returns to the general pool.

use crate::proxy_protocol::ProxyTlv;
use crate::IdState;
use bytes::BytesMut;
use reeve_config::BackendConfig;
use reeve_proto::{FrameCodec, Header};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace, warn};

/// Monotonic source of backend ids (pool keys).
static BACKEND_ID: AtomicUsize = AtomicUsize::new(0);

/// Monotonic source of backend-connection ids.
static CONN_ID: AtomicUsize = AtomicUsize::new(0);

/// A downstream DNS server.
#[derive(Debug)]
pub struct Backend {
    /// Process-unique id, used as the pool key.
    pub id: usize,

    /// Name used in logs.
    pub name: String,

    /// Server address.
    pub addr: SocketAddr,

    /// Prepend a PROXY v2 payload on each fresh connection.
    pub use_proxy_protocol: bool,

    /// Connect timeout.
    pub connect_timeout: Duration,

    /// Response read timeout.
    pub read_timeout: Duration,

    /// Query write timeout.
    pub write_timeout: Duration,

    /// Reconnect attempts before in-flight queries are failed.
    pub retries: u32,

    /// Counters.
    pub stats: BackendStats,
}

impl Backend {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            id: BACKEND_ID.fetch_add(1, Ordering::Relaxed),
            name: config.display_name(),
            addr: config.address,
            use_proxy_protocol: config.use_proxy_protocol,
            connect_timeout: Duration::from_secs(config.connect_timeout),
            read_timeout: Duration::from_secs(config.read_timeout),
            write_timeout: Duration::from_secs(config.write_timeout),
            retries: config.retries,
            stats: BackendStats::default(),
        }
    }

    /// A backend with short timeouts, for tests.
    pub fn for_tests(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            id: BACKEND_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            addr,
            use_proxy_protocol: false,
            connect_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(2),
            retries: 1,
            stats: BackendStats::default(),
        }
    }
}

/// Per-backend counters.
#[derive(Debug, Default)]
pub struct BackendStats {
    /// Queries currently awaiting a response.
    pub outstanding: AtomicU64,

    /// Queries written to this backend.
    pub queries: AtomicU64,

    /// Responses received from this backend.
    pub responses: AtomicU64,

    /// TCP connections opened.
    pub tcp_new_connections: AtomicU64,

    /// Pooled or active connections reused for another query.
    pub tcp_reused_connections: AtomicU64,

    /// Currently open TCP connections.
    pub tcp_current_connections: AtomicU64,

    /// Connections that died while writing a query.
    pub tcp_died_sending_query: AtomicU64,

    /// Connections that died while reading a response.
    pub tcp_died_reading_response: AtomicU64,

    /// Connections abandoned after exhausting reconnect attempts.
    pub tcp_gave_up: AtomicU64,

    /// Response read timeouts.
    pub tcp_read_timeouts: AtomicU64,

    /// Query write timeouts.
    pub tcp_write_timeouts: AtomicU64,
}

/// Why in-flight queries on a backend connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureReason {
    /// The backend stopped answering in time.
    Timeout,

    /// Reconnect attempts were exhausted.
    GaveUp,

    /// The connection ended (peer close, protocol violation).
    Closed,
}

/// Event delivered to the owning client connection.
pub(crate) enum BackendEvent {
    /// A response arrived for one of the client's queries.
    Response {
        buffer: BytesMut,
        ids: IdState,
        conn_id: usize,
    },

    /// A query will never be answered.
    Failed {
        ids: IdState,
        reason: FailureReason,
    },
}

/// Channel the client receives backend events on.
pub(crate) type EventSender = mpsc::UnboundedSender<BackendEvent>;

/// A query submitted to a backend connection.
pub(crate) struct BackendQuery {
    /// Length-prefixed DNS message.
    pub buffer: BytesMut,

    /// In-flight bookkeeping; returns with the response.
    pub ids: IdState,

    /// PROXY v2 payload to emit before the first DNS bytes, if any.
    pub proxy_payload: Option<Vec<u8>>,

    /// Reply channel of the submitting client.
    pub reply: EventSender,

    /// True when this query is a zone transfer.
    pub xfr: bool,
}

/// State shared between the handle and the transport task.
#[derive(Debug)]
struct ConnShared {
    conn_id: usize,
    fresh: bool,
    reused: bool,
    died: bool,
    used_for_xfr: bool,
    pending: usize,
    tlvs_sent: Option<Vec<ProxyTlv>>,
}

/// Handle to a worker-local backend connection.
#[derive(Clone)]
pub(crate) struct BackendConn {
    backend: Arc<Backend>,
    shared: Rc<RefCell<ConnShared>>,
    cmd_tx: mpsc::UnboundedSender<BackendQuery>,
}

impl BackendConn {
    /// Creates a fresh connection to `backend`.
    ///
    /// The transport task starts connecting immediately; queries submitted
    /// meanwhile queue on the command channel, so creation never blocks the
    /// client state machine.
    pub(crate) fn spawn(backend: Arc<Backend>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Rc::new(RefCell::new(ConnShared {
            conn_id: CONN_ID.fetch_add(1, Ordering::Relaxed),
            fresh: true,
            reused: false,
            died: false,
            used_for_xfr: false,
            pending: 0,
            tlvs_sent: None,
        }));

        let transport = Transport {
            backend: backend.clone(),
            shared: shared.clone(),
            cmd_rx,
            pending: HashMap::new(),
            payload: None,
            payload_written: false,
            queries_sent: 0,
        };
        tokio::task::spawn_local(transport.run());

        Self {
            backend,
            shared,
            cmd_tx,
        }
    }

    pub(crate) fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub(crate) fn conn_id(&self) -> usize {
        self.shared.borrow().conn_id
    }

    /// True until the first query is submitted.
    pub(crate) fn is_fresh(&self) -> bool {
        self.shared.borrow().fresh
    }

    /// No queries awaiting responses.
    pub(crate) fn is_idle(&self) -> bool {
        self.shared.borrow().pending == 0
    }

    /// The transport is still alive and able to carry queries.
    pub(crate) fn is_usable(&self) -> bool {
        !self.shared.borrow().died && !self.cmd_tx.is_closed()
    }

    /// More queries may be multiplexed onto this connection.
    pub(crate) fn can_accept_new_queries(&self) -> bool {
        let shared = self.shared.borrow();
        !shared.died && !shared.used_for_xfr
    }

    /// Safe to park in the general pool.
    ///
    /// TLV-tainted connections are excluded: the downstream demultiplexes
    /// by the TLV state established at connection open.
    pub(crate) fn can_be_reused(&self) -> bool {
        let shared = self.shared.borrow();
        !shared.died && !shared.used_for_xfr && shared.tlvs_sent.is_none()
    }

    /// True when `tlvs` is compatible with what this connection carried.
    pub(crate) fn matches_tlvs(&self, tlvs: Option<&[ProxyTlv]>) -> bool {
        let shared = self.shared.borrow();
        match (&shared.tlvs_sent, tlvs) {
            (None, None) => true,
            (Some(sent), Some(offered)) => sent.as_slice() == offered,
            _ => false,
        }
    }

    /// Marks the connection as picked up for reuse.
    pub(crate) fn set_reused(&self) {
        let mut shared = self.shared.borrow_mut();
        if !shared.reused {
            shared.reused = true;
        }
        self.backend
            .stats
            .tcp_reused_connections
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Records the TLV set this connection now carries. First set wins.
    pub(crate) fn set_tlvs_sent(&self, tlvs: &[ProxyTlv]) {
        let mut shared = self.shared.borrow_mut();
        if shared.tlvs_sent.is_none() {
            shared.tlvs_sent = Some(tlvs.to_vec());
        }
    }

    /// Submits a query. Returns false if the transport is gone.
    pub(crate) fn send_query(&self, query: BackendQuery) -> bool {
        {
            let mut shared = self.shared.borrow_mut();
            shared.fresh = false;
            shared.pending += 1;
            if query.xfr {
                shared.used_for_xfr = true;
            }
        }
        if self.cmd_tx.send(query).is_err() {
            let mut shared = self.shared.borrow_mut();
            shared.pending -= 1;
            shared.died = true;
            return false;
        }
        true
    }
}

/// A query written to the backend, awaiting its response.
struct Pending {
    buffer: BytesMut,
    ids: IdState,
    reply: EventSender,
}

/// How a transport session ended.
enum SessionEnd {
    /// All handles dropped and nothing in flight.
    Finished,

    /// I/O failure; reconnect may be appropriate.
    Error,

    /// The backend stopped answering in time. Never retried.
    Timeout,
}

/// The task that owns the socket to the backend.
struct Transport {
    backend: Arc<Backend>,
    shared: Rc<RefCell<ConnShared>>,
    cmd_rx: mpsc::UnboundedReceiver<BackendQuery>,
    pending: HashMap<u16, Pending>,
    payload: Option<Vec<u8>>,
    payload_written: bool,
    queries_sent: u64,
}

impl Transport {
    async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            // Connect, counting each attempt against the retry budget.
            let mut stream = loop {
                match timeout(
                    self.backend.connect_timeout,
                    TcpStream::connect(self.backend.addr),
                )
                .await
                {
                    Ok(Ok(stream)) => break stream,
                    Ok(Err(e)) => {
                        debug!(backend = %self.backend.name, error = %e, "backend connect failed");
                    }
                    Err(_) => {
                        debug!(backend = %self.backend.name, "backend connect timed out");
                    }
                }
                failures += 1;
                if failures > self.backend.retries {
                    self.backend.stats.tcp_gave_up.fetch_add(1, Ordering::Relaxed);
                    self.fail_all(FailureReason::GaveUp);
                    return;
                }
            };

            let _ = stream.set_nodelay(true);
            self.backend
                .stats
                .tcp_new_connections
                .fetch_add(1, Ordering::Relaxed);
            self.backend
                .stats
                .tcp_current_connections
                .fetch_add(1, Ordering::Relaxed);
            self.payload_written = false;
            let mut codec = FrameCodec::new();

            // A reconnect must resend every query still awaiting a response.
            let resent = self.resend_pending(&mut stream).await;

            let end = if resent {
                self.session(&mut stream, &mut codec).await
            } else {
                SessionEnd::Error
            };

            self.backend
                .stats
                .tcp_current_connections
                .fetch_sub(1, Ordering::Relaxed);

            match end {
                SessionEnd::Finished => return,
                SessionEnd::Timeout => {
                    self.fail_all(FailureReason::Timeout);
                    return;
                }
                SessionEnd::Error => {
                    let xfr_started = self.shared.borrow().used_for_xfr && self.queries_sent > 0;
                    failures += 1;
                    if xfr_started || self.pending.is_empty() {
                        // A transfer stream ending or an idle connection
                        // closing is not a failure worth retrying.
                        self.fail_all(FailureReason::Closed);
                        return;
                    }
                    if failures > self.backend.retries {
                        self.backend.stats.tcp_gave_up.fetch_add(1, Ordering::Relaxed);
                        self.fail_all(FailureReason::GaveUp);
                        return;
                    }
                    debug!(
                        backend = %self.backend.name,
                        attempt = failures,
                        in_flight = self.pending.len(),
                        "reconnecting to backend"
                    );
                }
            }
        }
    }

    /// Replays in-flight queries after a (re)connect.
    async fn resend_pending(&mut self, stream: &mut TcpStream) -> bool {
        if self.pending.is_empty() {
            return true;
        }

        let buffers: Vec<BytesMut> = self.pending.values().map(|p| p.buffer.clone()).collect();
        for buffer in buffers {
            if self.write_message(stream, &buffer).await.is_err() {
                self.backend
                    .stats
                    .tcp_died_sending_query
                    .fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        true
    }

    /// Writes one length-prefixed message, emitting the PROXY payload first
    /// if it has not been written on this socket yet.
    async fn write_message(
        &mut self,
        stream: &mut TcpStream,
        buffer: &[u8],
    ) -> std::result::Result<(), SessionEnd> {
        if !self.payload_written {
            if let Some(payload) = self.payload.clone() {
                self.write_all_timed(stream, &payload).await?;
                self.payload_written = true;
            }
        }
        self.write_all_timed(stream, buffer).await
    }

    async fn write_all_timed(
        &self,
        stream: &mut TcpStream,
        data: &[u8],
    ) -> std::result::Result<(), SessionEnd> {
        match timeout(self.backend.write_timeout, stream.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!(backend = %self.backend.name, error = %e, "backend write failed");
                Err(SessionEnd::Error)
            }
            Err(_) => {
                self.backend
                    .stats
                    .tcp_write_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                Err(SessionEnd::Timeout)
            }
        }
    }

    async fn session(&mut self, stream: &mut TcpStream, codec: &mut FrameCodec) -> SessionEnd {
        let mut read_deadline = Instant::now() + self.backend.read_timeout;

        loop {
            let has_pending = !self.pending.is_empty();

            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(query) => {
                        match self.submit(stream, query).await {
                            Ok(()) => read_deadline = Instant::now() + self.backend.read_timeout,
                            Err(end) => return end,
                        }
                    }
                    None => {
                        // Every handle is gone: the pool evicted us or the
                        // client vanished. Nothing can submit more queries.
                        if self.pending.is_empty() {
                            return SessionEnd::Finished;
                        }
                        self.shared.borrow_mut().died = true;
                        return SessionEnd::Finished;
                    }
                },

                frame = read_frame(stream, codec) => match frame {
                    Ok(frame) => {
                        read_deadline = Instant::now() + self.backend.read_timeout;
                        if !self.handle_response(frame) {
                            return SessionEnd::Error;
                        }
                    }
                    Err(e) => {
                        // EOF on a transfer connection is how the backend
                        // signals the end of the stream, not a death.
                        let xfr_eof = self.shared.borrow().used_for_xfr
                            && e.kind() == std::io::ErrorKind::UnexpectedEof;
                        if xfr_eof {
                            trace!(backend = %self.backend.name, "backend closed transfer stream");
                        } else {
                            self.backend
                                .stats
                                .tcp_died_reading_response
                                .fetch_add(1, Ordering::Relaxed);
                            debug!(backend = %self.backend.name, error = %e, "backend read failed");
                        }
                        return SessionEnd::Error;
                    }
                },

                _ = sleep_until(read_deadline), if has_pending => {
                    self.backend
                        .stats
                        .tcp_read_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(backend = %self.backend.name, "timeout waiting for backend response");
                    return SessionEnd::Timeout;
                }
            }
        }
    }

    /// Writes a freshly submitted query and registers it as pending.
    async fn submit(
        &mut self,
        stream: &mut TcpStream,
        query: BackendQuery,
    ) -> std::result::Result<(), SessionEnd> {
        let BackendQuery {
            buffer,
            ids,
            proxy_payload,
            reply,
            xfr,
        } = query;

        if self.payload.is_none() {
            self.payload = proxy_payload;
        }

        if self.pending.contains_key(&ids.id) {
            // A duplicate id cannot be demultiplexed; refuse the query.
            trace!(backend = %self.backend.name, id = ids.id, "duplicate query id on connection");
            self.shared.borrow_mut().pending -= 1;
            let _ = reply.send(BackendEvent::Failed {
                ids,
                reason: FailureReason::Closed,
            });
            return Ok(());
        }

        match self.write_message(stream, &buffer).await {
            Ok(()) => {
                self.queries_sent += 1;
                self.backend.stats.queries.fetch_add(1, Ordering::Relaxed);
                if !xfr {
                    self.backend
                        .stats
                        .outstanding
                        .fetch_add(1, Ordering::Relaxed);
                }
                self.pending.insert(ids.id, Pending { buffer, ids, reply });
                Ok(())
            }
            Err(end) => {
                self.backend
                    .stats
                    .tcp_died_sending_query
                    .fetch_add(1, Ordering::Relaxed);
                // Register it anyway; a reconnect will resend it.
                self.pending.insert(ids.id, Pending { buffer, ids, reply });
                Err(end)
            }
        }
    }

    /// Routes one response frame back to its client. Returns false when the
    /// connection can no longer be trusted.
    fn handle_response(&mut self, frame: BytesMut) -> bool {
        let xfr = self.shared.borrow().used_for_xfr;

        if xfr {
            // Zone transfers stream multiple messages for the one pending
            // query; each chunk is delivered with a copy of its id state.
            let conn_id = self.shared.borrow().conn_id;
            if let Some(pending) = self.pending.values().next() {
                self.backend.stats.responses.fetch_add(1, Ordering::Relaxed);
                let _ = pending.reply.send(BackendEvent::Response {
                    buffer: frame,
                    ids: pending.ids.clone(),
                    conn_id,
                });
            }
            return true;
        }

        let header = match Header::parse(&frame) {
            Ok(h) => h,
            Err(_) => return false,
        };

        let pending = match self.pending.remove(&header.id) {
            Some(p) => p,
            None => {
                // Most likely a duplicated id over this connection; nothing
                // can be delivered safely anymore.
                debug!(backend = %self.backend.name, id = header.id, "response without matching query");
                return false;
            }
        };

        {
            let mut shared = self.shared.borrow_mut();
            shared.pending = shared.pending.saturating_sub(1);
        }
        self.backend
            .stats
            .outstanding
            .fetch_sub(1, Ordering::Relaxed);
        self.backend.stats.responses.fetch_add(1, Ordering::Relaxed);

        let conn_id = self.shared.borrow().conn_id;
        let _ = pending.reply.send(BackendEvent::Response {
            buffer: frame,
            ids: pending.ids,
            conn_id,
        });
        true
    }

    /// Fails every in-flight query and marks the connection dead.
    ///
    /// Queries still queued on the command channel are failed too; their
    /// clients counted them in flight the moment they were submitted.
    fn fail_all(&mut self, reason: FailureReason) {
        let xfr = self.shared.borrow().used_for_xfr;
        if !xfr {
            self.backend
                .stats
                .outstanding
                .fetch_sub(self.pending.len() as u64, Ordering::Relaxed);
        }

        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(BackendEvent::Failed {
                ids: pending.ids,
                reason,
            });
        }

        while let Ok(query) = self.cmd_rx.try_recv() {
            let _ = query.reply.send(BackendEvent::Failed {
                ids: query.ids,
                reason,
            });
        }

        let mut shared = self.shared.borrow_mut();
        shared.pending = 0;
        shared.died = true;
    }
}

/// Reads one length-prefixed message from the backend.
async fn read_frame(stream: &mut TcpStream, codec: &mut FrameCodec) -> std::io::Result<BytesMut> {
    loop {
        match codec.decode() {
            Ok(Some(frame)) => return Ok(frame),
            Ok(None) => {}
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    e.to_string(),
                ))
            }
        }

        let n = stream.read_buf(codec.buffer_mut()).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reeve_proto::Name;

    fn ids(id: u16) -> IdState {
        IdState {
            id,
            qname: Name::root(),
            qtype: 1,
            qclass: 1,
            sent_at: std::time::Instant::now(),
            origin: "127.0.0.1:5000".parse().unwrap(),
            cache_skipped: false,
        }
    }

    #[test]
    fn backend_ids_are_unique() {
        let a = Backend::for_tests("a", "127.0.0.1:53".parse().unwrap());
        let b = Backend::for_tests("b", "127.0.0.1:53".parse().unwrap());
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn tlv_matching_rules() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let backend =
                    Arc::new(Backend::for_tests("t", "127.0.0.1:1".parse().unwrap()));
                let conn = BackendConn::spawn(backend);

                let tlvs = vec![ProxyTlv {
                    kind: 0xE0,
                    value: vec![1, 2, 3],
                }];

                // A virgin connection matches only the empty set.
                assert!(conn.matches_tlvs(None));
                assert!(!conn.matches_tlvs(Some(&tlvs)));
                assert!(conn.can_be_reused());

                // Once tainted, only the identical set matches, and the
                // connection is banned from the general pool.
                conn.set_tlvs_sent(&tlvs);
                assert!(conn.matches_tlvs(Some(&tlvs)));
                assert!(!conn.matches_tlvs(None));
                assert!(!conn.matches_tlvs(Some(&[])));
                assert!(!conn.can_be_reused());

                // The first TLV set is immutable.
                conn.set_tlvs_sent(&[]);
                assert!(conn.matches_tlvs(Some(&tlvs)));

                let different = vec![ProxyTlv {
                    kind: 0xE0,
                    value: vec![9, 9, 9],
                }];
                assert!(!conn.matches_tlvs(Some(&different)));
            })
            .await;
    }

    #[tokio::test]
    async fn xfr_connection_accepts_no_new_queries() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let backend =
                    Arc::new(Backend::for_tests("t", "127.0.0.1:1".parse().unwrap()));
                let conn = BackendConn::spawn(backend);
                let (tx, _rx) = mpsc::unbounded_channel();

                assert!(conn.can_accept_new_queries());
                conn.send_query(BackendQuery {
                    buffer: BytesMut::new(),
                    ids: ids(1),
                    proxy_payload: None,
                    reply: tx,
                    xfr: true,
                });
                assert!(!conn.can_accept_new_queries());
                assert!(!conn.can_be_reused());
                assert!(!conn.is_fresh());
            })
            .await;
    }
}
