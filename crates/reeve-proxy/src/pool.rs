//! Worker-local cache of idle backend connections.

use crate::backend::BackendConn;
use std::collections::HashMap;
use std::collections::VecDeque;
use tracing::trace;

/// Idle reusable connections surviving beyond this cap are dropped.
const MAX_IDLE_PER_BACKEND: usize = 20;

/// Idle-connection cache, keyed by backend id.
///
/// Owned by exactly one worker; never shared, never locked.
#[derive(Default)]
pub(crate) struct DownstreamPool {
    idle: HashMap<usize, VecDeque<BackendConn>>,
}

impl DownstreamPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Takes an idle connection to `backend_id`, if one survives.
    pub(crate) fn get(&mut self, backend_id: usize) -> Option<BackendConn> {
        let list = self.idle.get_mut(&backend_id)?;
        while let Some(conn) = list.pop_front() {
            if conn.is_usable() {
                conn.set_reused();
                return Some(conn);
            }
            // Half-closed or dead while parked; discard and keep looking.
        }
        None
    }

    /// Parks an idle connection for reuse.
    ///
    /// Connections that cannot be reused (dead, zone-transfer, or bound to
    /// a PROXY TLV identity) are dropped, as is any surplus beyond the
    /// per-backend cap.
    pub(crate) fn release(&mut self, conn: BackendConn) {
        if !conn.can_be_reused() || !conn.is_usable() {
            return;
        }

        let list = self.idle.entry(conn.backend().id).or_default();
        if list.len() >= MAX_IDLE_PER_BACKEND {
            trace!(
                backend = %conn.backend().name,
                "idle connection cap reached, dropping surplus connection"
            );
            return;
        }

        list.push_back(conn);
    }

    /// Drops pooled connections whose socket is no longer usable.
    pub(crate) fn sweep(&mut self) {
        self.idle.retain(|_, list| {
            list.retain(|conn| conn.is_usable());
            !list.is_empty()
        });
    }

    /// Number of idle connections parked for `backend_id`.
    #[cfg(test)]
    pub(crate) fn idle_count(&self, backend_id: usize) -> usize {
        self.idle.get(&backend_id).map_or(0, VecDeque::len)
    }
}
