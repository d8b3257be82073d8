//! The per-client connection state machine.
//!
//! One task per accepted connection, pinned to its worker. The machine
//! advances handshake → optional PROXY header → query loop, with several
//! queries in flight at once. Backend responses arrive on the connection's
//! event channel and are written back in arrival order; the channel doubles
//! as the queued-response FIFO and is only drained at frame boundaries,
//! never in the middle of reading a query body.

use crate::backend::{Backend, BackendConn, BackendEvent, BackendQuery, FailureReason};
use crate::frontend::ConnectionInfo;
use crate::pool::DownstreamPool;
use crate::proxy::ProxyShared;
use crate::proxy_protocol::{self, ProxyParse, ProxyTlv};
use crate::stream::Stream;
use crate::{policy::QueryContext, policy::Verdict, IdState, ProxyError, Result};
use bytes::{Buf, BytesMut};
use reeve_proto::{
    frame::prefix_message, response_content_matches, FrameCodec, Header, Name, Question,
    RecordType, ResponseCode, HEADER_SIZE,
};
use rustls::ProtocolVersion;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use std::{cell::RefCell, time::Duration};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant as TokioInstant};
use tracing::{debug, trace, warn};

/// Discrete state of a client connection.
///
/// Kept current so a failure can be credited to the right counter; the
/// "idle but zone-transfer" and "idle accepting queries" distinctions are
/// separate flags, orthogonal to this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    ReadingProxyHeader,
    ReadingQuerySize,
    ReadingQuery,
    Idle,
    SendingResponse,
}

/// A response ready to be written to the client.
struct TcpResponse {
    /// Response bytes, without length prefix.
    buffer: BytesMut,

    /// Cleartext header copy, for rcode classification.
    header: Header,

    /// The in-flight entry this response completes.
    ids: IdState,

    /// Built locally rather than received from a backend.
    self_generated: bool,
}

pub(crate) struct IncomingConnection {
    shared: Arc<ProxyShared>,
    frontend: Arc<crate::frontend::Frontend>,
    pool: Rc<RefCell<DownstreamPool>>,

    stream: Stream,
    codec: FrameCodec,
    state: ConnState,

    peer: SocketAddr,
    proxied_remote: SocketAddr,
    proxied_destination: SocketAddr,
    proxy_tlvs: Option<Vec<ProxyTlv>>,
    proxy_payload_has_tlv: bool,

    queries: u64,
    in_flight: usize,
    is_xfr: bool,
    xfr_started: bool,
    reading_first_query: bool,

    active: HashMap<usize, VecDeque<BackendConn>>,
    event_tx: mpsc::UnboundedSender<BackendEvent>,
    event_rx: mpsc::UnboundedReceiver<BackendEvent>,

    started: Instant,
    first_query_at: Option<Instant>,

    _info: ConnectionGuards,
}

/// RAII pieces carried for the lifetime of the connection.
struct ConnectionGuards {
    _client: crate::frontend::ClientCountGuard,
    _conn: crate::frontend::CurrentConnectionGuard,
}

/// Entry point: runs one accepted connection to completion.
pub(crate) async fn run(
    info: ConnectionInfo,
    pool: Rc<RefCell<DownstreamPool>>,
    shared: Arc<ProxyShared>,
) {
    let frontend = info.frontend.clone();
    let peer = info.peer;

    let mut conn = match IncomingConnection::setup(info, pool, shared).await {
        Ok(Some(conn)) => conn,
        Ok(None) => return,
        Err(e) => {
            frontend
                .stats
                .tcp_died_reading_query
                .fetch_add(1, Ordering::Relaxed);
            debug!(client = %peer, error = %e, "connection setup failed");
            return;
        }
    };

    let result = conn.drive().await;
    conn.finish(result);
}

impl IncomingConnection {
    /// Accepts the transport: TCP registration plus the TLS handshake.
    ///
    /// Returns `Ok(None)` when the connection was closed cleanly before it
    /// produced a usable stream (handshake timeout).
    async fn setup(
        info: ConnectionInfo,
        pool: Rc<RefCell<DownstreamPool>>,
        shared: Arc<ProxyShared>,
    ) -> Result<Option<Self>> {
        let ConnectionInfo {
            stream,
            peer,
            frontend,
            client_guard,
            conn_guard,
        } = info;

        let socket = TcpStream::from_std(stream)?;
        let local = socket.local_addr()?;
        let started = Instant::now();

        let stream = match &frontend.tls {
            None => Stream::Plain(socket),
            Some(acceptor) => {
                let handshake = Stream::accept_tls(acceptor, socket);
                let (stream, tls) = match timeout(shared.read_timeout, handshake).await {
                    Ok(done) => done?,
                    Err(_) => {
                        frontend
                            .stats
                            .tcp_client_timeouts
                            .fetch_add(1, Ordering::Relaxed);
                        return Ok(None);
                    }
                };

                match tls.version {
                    Some(ProtocolVersion::TLSv1_2) => {
                        frontend
                            .stats
                            .tls12_connections
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Some(ProtocolVersion::TLSv1_3) => {
                        frontend
                            .stats
                            .tls13_connections
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        frontend
                            .stats
                            .tls_unknown_connections
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
                if tls.resumed {
                    frontend
                        .stats
                        .tls_resumptions
                        .fetch_add(1, Ordering::Relaxed);
                } else {
                    frontend
                        .stats
                        .tls_new_sessions
                        .fetch_add(1, Ordering::Relaxed);
                }

                stream
            }
        };

        trace!(client = %peer, local = %local, listener = %frontend.config.address, "new TCP connection");

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(Some(Self {
            shared,
            frontend,
            pool,
            stream,
            codec: FrameCodec::new(),
            state: ConnState::ReadingQuerySize,
            peer,
            proxied_remote: peer,
            proxied_destination: local,
            proxy_tlvs: None,
            proxy_payload_has_tlv: false,
            queries: 0,
            in_flight: 0,
            is_xfr: false,
            xfr_started: false,
            reading_first_query: true,
            active: HashMap::new(),
            event_tx,
            event_rx,
            started,
            first_query_at: None,
            _info: ConnectionGuards {
                _client: client_guard,
                _conn: conn_guard,
            },
        }))
    }

    /// The main loop. `Ok(())` is a deliberate close; `Err` is a death that
    /// gets classified by the state it happened in.
    async fn drive(&mut self) -> Result<()> {
        if self
            .frontend
            .config
            .expects_proxy_protocol_from(self.peer.ip())
        {
            self.state = ConnState::ReadingProxyHeader;
            if !self.read_proxy_header().await? {
                return Ok(());
            }
        }

        loop {
            let read_ttd = match self.read_deadline() {
                Some(deadline) => deadline,
                None => {
                    debug!(client = %self.peer, "closing connection: maximum duration reached");
                    return Ok(());
                }
            };

            if !self.can_accept_new_queries() {
                if self.is_xfr && self.in_flight == 0 {
                    // The transfer stream has fully drained.
                    return Ok(());
                }

                self.state = ConnState::Idle;
                match timeout_at(read_ttd, self.event_rx.recv()).await {
                    Ok(Some(event)) => {
                        if !self.handle_event(event).await? {
                            return Ok(());
                        }
                    }
                    Ok(None) => return Ok(()),
                    Err(_) => {
                        self.frontend
                            .stats
                            .tcp_client_timeouts
                            .fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                }
                continue;
            }

            if self.codec.mid_message() {
                // Mid-way through a query body: arriving responses stay
                // queued until the frame boundary.
                self.state = ConnState::ReadingQuery;
                let read = timeout_at(read_ttd, read_frame(&mut self.stream, &mut self.codec)).await;
                if !self.handle_read_result(read).await? {
                    return Ok(());
                }
                continue;
            }

            self.state = ConnState::ReadingQuerySize;
            tokio::select! {
                biased;

                event = self.event_rx.recv() => {
                    if let Some(event) = event {
                        if !self.handle_event(event).await? {
                            return Ok(());
                        }
                    }
                }

                read = timeout_at(read_ttd, read_frame(&mut self.stream, &mut self.codec)) => {
                    if !self.handle_read_result(read).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Settles one attempt at reading a query frame. Returns false when
    /// the connection must close cleanly.
    async fn handle_read_result(
        &mut self,
        read: std::result::Result<Result<BytesMut>, tokio::time::error::Elapsed>,
    ) -> Result<bool> {
        match read {
            Ok(Ok(frame)) => self.handle_query(frame).await,
            Ok(Err(ProxyError::Proto(err @ reeve_proto::Error::MessageTooShort { .. }))) => {
                reeve_metrics::metrics().record_non_compliant();
                debug!(client = %self.peer, error = %err, "closing connection: undersized query");
                Ok(false)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => self.handle_read_timeout().await,
        }
    }

    /// Closes the books on the connection.
    fn finish(&mut self, result: Result<()>) {
        if let Err(e) = result {
            match self.state {
                ConnState::SendingResponse => {
                    self.frontend
                        .stats
                        .tcp_died_sending_response
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(client = %self.peer, error = %e, "connection died sending response");
                }
                _ => {
                    self.frontend
                        .stats
                        .tcp_died_reading_query
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(client = %self.peer, error = %e, "connection died reading query");
                }
            }
        }

        // Idle reusable backend connections survive this client.
        for (_, mut list) in self.active.drain() {
            for conn in list.drain(..) {
                if conn.is_idle() {
                    self.pool.borrow_mut().release(conn);
                }
            }
        }

        let duration_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.frontend
            .stats
            .update_tcp_metrics(self.queries, duration_ms);
        trace!(
            client = %self.peer,
            queries = self.queries,
            duration_ms,
            idle_before_first_query_ms = self
                .first_query_at
                .map(|t| (t - self.started).as_secs_f64() * 1000.0),
            "TCP connection closed"
        );
    }

    fn can_accept_new_queries(&self) -> bool {
        if self.is_xfr {
            return false;
        }
        self.in_flight < self.frontend.config.max_in_flight_queries_per_conn
    }

    /// Deadline for the next client read, bounded by the remaining
    /// connection-duration budget. `None` means the budget is spent.
    fn read_deadline(&self) -> Option<TokioInstant> {
        let read = self.shared.read_timeout;
        match self.shared.max_connection_duration {
            None => Some(TokioInstant::now() + read),
            Some(max) => {
                let elapsed = self.started.elapsed();
                if elapsed >= max {
                    return None;
                }
                Some(TokioInstant::now() + read.min(max - elapsed))
            }
        }
    }

    fn write_deadline(&self) -> Duration {
        match self.shared.max_connection_duration {
            None => self.shared.write_timeout,
            Some(max) => {
                let remaining = max.saturating_sub(self.started.elapsed());
                self.shared.write_timeout.min(remaining.max(Duration::from_millis(1)))
            }
        }
    }

    /// Read-side timeout. With queries in flight the connection goes idle
    /// and keeps writing; it only dies when nothing arrives either.
    async fn handle_read_timeout(&mut self) -> Result<bool> {
        if self.in_flight == 0 {
            self.frontend
                .stats
                .tcp_client_timeouts
                .fetch_add(1, Ordering::Relaxed);
            debug!(client = %self.peer, "read timeout with no queries in flight");
            return Ok(false);
        }

        trace!(client = %self.peer, in_flight = self.in_flight, "read timeout, going idle");
        self.state = ConnState::Idle;
        match timeout(self.shared.read_timeout, self.event_rx.recv()).await {
            Ok(Some(event)) => self.handle_event(event).await,
            Ok(None) => Ok(false),
            Err(_) => {
                self.frontend
                    .stats
                    .tcp_client_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
        }
    }

    /// Consumes the PROXY protocol header preceding the first DNS message.
    ///
    /// Returns false when the header is invalid and the connection must
    /// close. The parser states exactly how many more bytes it needs; the
    /// read grows by that amount each round.
    async fn read_proxy_header(&mut self) -> Result<bool> {
        let mut need = proxy_protocol::MINIMUM_HEADER_SIZE;

        loop {
            while self.codec.buffered() < need {
                let read = self.stream.read_buf(self.codec.buffer_mut());
                match timeout(self.shared.read_timeout, read).await {
                    Ok(Ok(0)) => {
                        return Err(ProxyError::Io(std::io::ErrorKind::UnexpectedEof.into()))
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => {
                        self.frontend
                            .stats
                            .tcp_client_timeouts
                            .fetch_add(1, Ordering::Relaxed);
                        return Ok(false);
                    }
                }
            }

            match proxy_protocol::parse_header(&self.codec.buffer_mut()[..]) {
                ProxyParse::Complete { header, consumed } => {
                    self.codec.buffer_mut().advance(consumed);
                    if !header.local {
                        if let Some(source) = header.source {
                            self.proxied_remote = source;
                        }
                        if let Some(destination) = header.destination {
                            self.proxied_destination = destination;
                        }
                        if !header.tlvs.is_empty() {
                            // The unaltered list must survive the whole
                            // connection; queries get fresh copies.
                            self.proxy_tlvs = Some(header.tlvs);
                        }
                    }
                    trace!(
                        client = %self.peer,
                        proxied = %self.proxied_remote,
                        "PROXY header consumed"
                    );
                    self.state = ConnState::ReadingQuerySize;
                    return Ok(true);
                }
                ProxyParse::Incomplete { need: more } => {
                    need = self.codec.buffered() + more;
                }
                ProxyParse::Invalid => {
                    reeve_metrics::metrics().record_proxy_protocol_invalid();
                    warn!(client = %self.peer, "invalid PROXY protocol header");
                    return Ok(false);
                }
            }
        }
    }

    /// One event off the backend channel. Returns false to close.
    async fn handle_event(&mut self, event: BackendEvent) -> Result<bool> {
        match event {
            BackendEvent::Failed { ids, reason } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                match reason {
                    FailureReason::Timeout => {
                        self.frontend
                            .stats
                            .tcp_downstream_timeouts
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    FailureReason::GaveUp => {
                        self.frontend
                            .stats
                            .tcp_gave_up
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    FailureReason::Closed => {}
                }
                debug!(
                    client = %self.peer,
                    qname = %ids.qname,
                    reason = ?reason,
                    "backend failed to answer"
                );
                Ok(true)
            }
            BackendEvent::Response {
                buffer,
                ids,
                conn_id,
            } => self.handle_response(buffer, ids, conn_id).await,
        }
    }

    /// A response (or transfer chunk) from a backend.
    async fn handle_response(
        &mut self,
        buffer: BytesMut,
        ids: IdState,
        conn_id: usize,
    ) -> Result<bool> {
        if !self.is_xfr {
            self.release_if_idle(conn_id);
        }

        if buffer.len() < HEADER_SIZE {
            return Ok(true);
        }

        if !response_content_matches(&buffer, ids.id, &ids.qname, ids.qtype, ids.qclass) {
            // Mismatches are dropped without touching the in-flight count;
            // only an accepted response or a backend error settles a query.
            debug!(
                client = %self.peer,
                qname = %ids.qname,
                "discarding backend response that does not match its query"
            );
            return Ok(true);
        }

        let mut buffer = buffer;
        if !self.shared.policy.process_response(&mut buffer, &ids).await {
            return Ok(true);
        }

        let header = Header::parse(&buffer)?;

        if self.is_xfr {
            if !self.xfr_started {
                self.xfr_started = true;
                self.count_response();
            }
        } else {
            self.count_response();
        }

        self.send_response(TcpResponse {
            buffer,
            header,
            ids,
            self_generated: false,
        })
        .await
    }

    fn count_response(&self) {
        self.frontend.stats.responses.fetch_add(1, Ordering::Relaxed);
        reeve_metrics::metrics().record_response();
    }

    /// Writes one response, then settles the per-connection accounting.
    /// Returns false when the connection must close.
    async fn send_response(&mut self, response: TcpResponse) -> Result<bool> {
        self.state = ConnState::SendingResponse;

        let deadline = self.write_deadline();
        let framed = prefix_message(&response.buffer);
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(&framed).await?;
            stream.flush().await
        };
        match timeout(deadline, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                // Write-side timeouts always close.
                self.frontend
                    .stats
                    .tcp_client_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                debug!(client = %self.peer, "write timeout sending response");
                return Ok(false);
            }
        }

        if !response.self_generated {
            trace!(
                client = %self.peer,
                qname = %response.ids.qname,
                elapsed_us = response.ids.sent_at.elapsed().as_micros() as u64,
                "response relayed"
            );
        }

        self.state = ConnState::Idle;

        if !self.is_xfr {
            self.in_flight = self.in_flight.saturating_sub(1);
            reeve_metrics::metrics().record_frontend_rcode(Some(response.header.rcode));

            let max_queries = self.shared.max_queries_per_conn;
            if max_queries > 0 && self.queries >= max_queries {
                debug!(
                    client = %self.peer,
                    queries = self.queries,
                    "closing connection: maximum queries per connection"
                );
                return Ok(false);
            }

            if self.read_deadline().is_none() {
                debug!(client = %self.peer, "closing connection: maximum duration reached");
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// A complete query frame from the client.
    async fn handle_query(&mut self, frame: BytesMut) -> Result<bool> {
        self.queries += 1;
        self.reading_first_query = self.queries == 1;
        if self.first_query_at.is_none() {
            self.first_query_at = Some(Instant::now());
        }
        self.frontend.stats.queries.fetch_add(1, Ordering::Relaxed);
        reeve_metrics::metrics().record_query();

        let mut buffer = frame;
        let header = match Header::parse(&buffer) {
            Ok(h) => h,
            Err(_) => {
                reeve_metrics::metrics().record_non_compliant();
                return Ok(true);
            }
        };

        if header.is_response() {
            // Not a query at all; drop the unit, keep the connection.
            reeve_metrics::metrics().record_non_compliant();
            return Ok(true);
        }

        if header.qd_count == 0 {
            // Nothing to dispatch on; answer NotImp in place.
            Header::patch_as_response(&mut buffer, ResponseCode::NotImp)?;
            let patched = Header::parse(&buffer)?;
            let ids = IdState {
                id: patched.id,
                qname: Name::root(),
                qtype: 0,
                qclass: 0,
                sent_at: Instant::now(),
                origin: self.proxied_remote,
                cache_skipped: false,
            };
            self.in_flight += 1;
            return self
                .send_response(TcpResponse {
                    buffer,
                    header: patched,
                    ids,
                    self_generated: true,
                })
                .await;
        }

        // A question that cannot be parsed poisons the framing; kill the
        // connection rather than guess.
        let question = Question::parse(&buffer)?;

        if self.reading_first_query && RecordType::is_zone_transfer(question.qtype) {
            self.is_xfr = true;
        }
        let skip_cache = self.is_xfr;

        let verdict = {
            let mut ctx = QueryContext {
                buffer: &mut buffer,
                header,
                question: &question,
                remote: self.proxied_remote,
                destination: self.proxied_destination,
                tlvs: self.proxy_tlvs.as_deref(),
                skip_cache,
            };
            self.shared.policy.process_query(&mut ctx).await
        };

        match verdict {
            Verdict::Drop => Ok(true),
            Verdict::Answer => {
                let patched = Header::parse(&buffer)?;
                let ids = IdState {
                    id: patched.id,
                    qname: question.qname,
                    qtype: question.qtype,
                    qclass: question.qclass,
                    sent_at: Instant::now(),
                    origin: self.proxied_remote,
                    cache_skipped: skip_cache,
                };
                self.in_flight += 1;
                self.send_response(TcpResponse {
                    buffer,
                    header: patched,
                    ids,
                    self_generated: true,
                })
                .await
            }
            Verdict::Forward(backend) => {
                self.forward_query(backend, buffer, header, question, skip_cache);
                Ok(true)
            }
        }
    }

    /// Hands a query to a backend connection, reusing one when possible.
    fn forward_query(
        &mut self,
        backend: Arc<Backend>,
        buffer: BytesMut,
        header: Header,
        question: Question,
        skip_cache: bool,
    ) {
        let ids = IdState {
            id: header.id,
            qname: question.qname,
            qtype: question.qtype,
            qclass: question.qclass,
            sent_at: Instant::now(),
            origin: self.proxied_remote,
            cache_skipped: skip_cache,
        };

        // Once a TLV payload has been sent on behalf of this client there
        // is no way back: its backend connections carry that identity.
        if backend.use_proxy_protocol && !self.proxy_payload_has_tlv {
            self.proxy_payload_has_tlv = self.proxy_tlvs.as_ref().is_some_and(|t| !t.is_empty());
        }

        let conn = self.get_downstream_connection(&backend);

        debug!(
            client = %self.proxied_remote,
            qname = %ids.qname,
            qtype = %RecordType::name_of(ids.qtype),
            backend = %backend.name,
            fresh = conn.is_fresh(),
            "relaying query"
        );

        let mut proxy_payload = None;
        if backend.use_proxy_protocol {
            let tlvs: &[ProxyTlv] = self.proxy_tlvs.as_deref().unwrap_or(&[]);
            proxy_payload = Some(proxy_protocol::encode_v2(
                self.proxied_remote,
                self.proxied_destination,
                tlvs,
            ));
        }

        // The connection adopts the client's TLV set as its reuse identity
        // the first time it carries one.
        if let Some(tlvs) = self.proxy_tlvs.as_deref() {
            if !tlvs.is_empty() {
                conn.set_tlvs_sent(tlvs);
            }
        }

        let submitted = conn.send_query(BackendQuery {
            buffer: prefix_message(&buffer),
            ids,
            proxy_payload,
            reply: self.event_tx.clone(),
            xfr: self.is_xfr,
        });

        if submitted {
            self.in_flight += 1;
        } else {
            debug!(
                client = %self.peer,
                backend = %backend.name,
                "backend connection refused query; dropping"
            );
        }
    }

    /// Picks a backend connection: the client's own active connections
    /// first (most recent wins), then the worker pool, then a fresh one.
    fn get_downstream_connection(&mut self, backend: &Arc<Backend>) -> BackendConn {
        let tlvs = self.proxy_tlvs.as_deref();

        if let Some(list) = self.active.get(&backend.id) {
            if let Some(conn) = list
                .iter()
                .find(|c| c.can_accept_new_queries() && c.matches_tlvs(tlvs))
            {
                conn.set_reused();
                return conn.clone();
            }
        }

        // A TLV-bearing client needs a connection that can still announce
        // its TLVs; pooled connections already spent their PROXY payload.
        let pooled = if backend.use_proxy_protocol && self.proxy_payload_has_tlv {
            None
        } else {
            self.pool.borrow_mut().get(backend.id)
        };

        let conn = pooled.unwrap_or_else(|| BackendConn::spawn(backend.clone()));
        self.active
            .entry(backend.id)
            .or_default()
            .push_front(conn.clone());
        conn
    }

    /// Detaches and pools the backend connection `conn_id` if it has gone
    /// idle and is still reusable.
    fn release_if_idle(&mut self, conn_id: usize) {
        for list in self.active.values_mut() {
            if let Some(pos) = list.iter().position(|c| c.conn_id() == conn_id) {
                if list[pos].is_idle() && list[pos].can_be_reused() {
                    if let Some(conn) = list.remove(pos) {
                        self.pool.borrow_mut().release(conn);
                    }
                }
                return;
            }
        }
    }
}

/// Reads one length-prefixed DNS message from the client.
///
/// All partial-frame state lives in the codec, so this future may be
/// dropped at any await point and re-created without losing bytes.
async fn read_frame(stream: &mut Stream, codec: &mut FrameCodec) -> Result<BytesMut> {
    loop {
        if let Some(frame) = codec.decode()? {
            return Ok(frame);
        }

        let n = stream.read_buf(codec.buffer_mut()).await?;
        if n == 0 {
            return Err(ProxyError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
    }
}
