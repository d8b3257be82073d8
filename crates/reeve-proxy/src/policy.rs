//! The policy seam.
//!
//! Rule evaluation is not the dataplane's business: every query is handed
//! to an opaque [`QueryPolicy`] that decides whether to drop it, answer it
//! in place, or forward it to a backend. The response path gets a
//! symmetric hook.

use crate::backend::Backend;
use crate::proxy_protocol::ProxyTlv;
use crate::IdState;
use async_trait::async_trait;
use bytes::BytesMut;
use reeve_proto::{Header, Question, ResponseCode};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Everything the policy may inspect about a query.
pub struct QueryContext<'a> {
    /// The raw DNS message, without length prefix. A policy answering in
    /// place rewrites this buffer into the response.
    pub buffer: &'a mut BytesMut,

    /// Parsed header copy.
    pub header: Header,

    /// The first question.
    pub question: &'a Question,

    /// Client address, after PROXY protocol substitution.
    pub remote: SocketAddr,

    /// Destination address, after PROXY protocol substitution.
    pub destination: SocketAddr,

    /// TLVs captured from the client's PROXY header, if any.
    pub tlvs: Option<&'a [ProxyTlv]>,

    /// Set when the cache layer must be bypassed (zone transfers).
    pub skip_cache: bool,
}

/// Policy decision for a query.
pub enum Verdict {
    /// Silently discard the query; the connection continues.
    Drop,

    /// The buffer now holds a complete response; write it back.
    Answer,

    /// Forward the query to the given backend.
    Forward(Arc<Backend>),
}

/// The query-processing oracle.
#[async_trait]
pub trait QueryPolicy: Send + Sync {
    /// Decides what to do with a query.
    async fn process_query(&self, ctx: &mut QueryContext<'_>) -> Verdict;

    /// Inspects (and may rewrite) a backend response before it is relayed.
    ///
    /// Returning false discards the response.
    async fn process_response(&self, _response: &mut BytesMut, _ids: &IdState) -> bool {
        true
    }
}

/// Forwards every query, rotating through the configured backends.
pub struct ForwardAll {
    backends: Vec<Arc<Backend>>,
    next: AtomicUsize,
}

impl ForwardAll {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends,
            next: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl QueryPolicy for ForwardAll {
    async fn process_query(&self, _ctx: &mut QueryContext<'_>) -> Verdict {
        if self.backends.is_empty() {
            return Verdict::Drop;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        Verdict::Forward(self.backends[idx].clone())
    }
}

/// Answers every query with REFUSED. Useful for tests.
pub struct RefuseAll;

#[async_trait]
impl QueryPolicy for RefuseAll {
    async fn process_query(&self, ctx: &mut QueryContext<'_>) -> Verdict {
        if Header::patch_as_response(ctx.buffer, ResponseCode::Refused).is_err() {
            return Verdict::Drop;
        }
        Verdict::Answer
    }
}
