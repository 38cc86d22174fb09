// ABOUTME: Pooled daemon session identity and its read-only snapshot
// ABOUTME: A session wraps one RpcCorrelator; mutable bookkeeping lives in the pool state

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::correlator::RpcCorrelator;
use super::health::HealthTier;

// === Session ID ===

/// Unique identifier for a pooled session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a new unique session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// === Pooled Session ===

/// One live connection to the daemon.
#[derive(Debug)]
pub struct PooledSession {
    id: SessionId,
    correlator: RpcCorrelator,
    created_at: DateTime<Utc>,
    opened: Instant,
}

impl PooledSession {
    #[must_use]
    pub fn new(correlator: RpcCorrelator) -> Self {
        Self {
            id: SessionId::new(),
            correlator,
            created_at: Utc::now(),
            opened: Instant::now(),
        }
    }

    pub const fn id(&self) -> SessionId {
        self.id
    }

    pub const fn correlator(&self) -> &RpcCorrelator {
        &self.correlator
    }

    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }

    pub fn is_connected(&self) -> bool {
        self.correlator.is_connected()
    }
}

/// Shared handle; the pool and the health monitor both hold one.
pub type SessionHandle = Arc<PooledSession>;

// === Snapshot ===

/// Point-in-time view of a session, as returned by `get_connections()`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    /// Time since the session was opened
    pub age: Duration,
    pub health: HealthTier,
    pub request_count: u64,
    /// Time since the session was last handed out or returned
    pub idle_for: Duration,
    pub available: bool,
    pub connected: bool,
    pub pending_calls: usize,
}
