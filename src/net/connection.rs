//! Upstream connection identity and lifecycle states.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing and stats
//! - Define the connection state machine and its legal transitions

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of an upstream connection. Shows up in logs and pool
/// snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cx-{}", self.0)
    }
}

/// Where a connection is in its life.
///
/// ```text
/// Connecting → Active → ShuttingDown → Closed
///      │          │                      ▲
///      └──────────┴──────────────────────┘  (disconnect, timeout)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport being established or peer settings not yet received.
    Connecting,
    /// Admitting new streams.
    Active,
    /// Peer announced graceful shutdown; in-flight streams finish, no new ones.
    ShuttingDown,
    /// Transport dropped; no stream is left on it.
    Closed,
}

impl ConnectionState {
    /// Whether a new stream may be admitted in this state.
    pub fn admits_streams(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Active)
                | (Connecting, ShuttingDown)
                | (Connecting, Closed)
                | (Active, ShuttingDown)
                | (Active, Closed)
                | (ShuttingDown, Closed)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::ShuttingDown => "shutting_down",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
