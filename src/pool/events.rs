// ABOUTME: Lifecycle events broadcast by the connection pool
// ABOUTME: Status changes, session churn, queueing and background errors

use serde::Serialize;

use super::health::HealthTier;
use super::session::SessionId;

/// Why a session left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Persistently failed health checks
    Unhealthy,
    /// Served its request quota
    Rotated,
    /// Transport died underneath it
    ConnectionLost,
    /// Idle past the idle timeout while the pool was above its minimum
    Idle,
    Shutdown,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unhealthy => "unhealthy",
            Self::Rotated => "rotated",
            Self::ConnectionLost => "connection lost",
            Self::Idle => "idle",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Observable pool lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    Ready {
        sessions: usize,
    },
    Degraded {
        healthy: usize,
        total: usize,
    },
    SessionAdded {
        session_id: SessionId,
    },
    SessionRemoved {
        session_id: SessionId,
        reason: RemovalReason,
    },
    SessionHealthChanged {
        session_id: SessionId,
        from: HealthTier,
        to: HealthTier,
    },
    DemandQueued {
        queue_size: usize,
    },
    /// A queued caller was handed a session
    DemandServed {
        session_id: SessionId,
        queue_size: usize,
    },
    /// A background operation (replacement, close) failed
    Error {
        message: String,
    },
    Shutdown,
}
