//! Connection identity and lifetime tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Tell the owning server loop when a client connection ends

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Held by a client task; reports the connection closed when dropped,
/// including when the task is aborted.
#[derive(Debug)]
pub struct ClientGuard {
    id: ConnectionId,
    closed: mpsc::UnboundedSender<ConnectionId>,
}

impl ClientGuard {
    pub fn new(id: ConnectionId, closed: mpsc::UnboundedSender<ConnectionId>) -> Self {
        Self { id, closed }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let _ = self.closed.send(self.id);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
