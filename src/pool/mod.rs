// ABOUTME: Client-side session pool for the Goxel daemon
//
// A fixed-endpoint daemon speaks newline-delimited JSON-RPC over a Unix socket and
// serves one request per session at a time. This module keeps a bounded set of those
// sessions open and hands them out to concurrent callers.
//
// Key components:
// - correlator: request id allocation, response matching, per-call timeouts and retries
// - session: one pooled session and its read-only snapshot
// - queue: bounded FIFO of callers waiting for a free session
// - health: periodic probes, latency tiers, trends and alerts
// - pool: acquire/release, scaling, rotation, eviction and shutdown
// - events / metrics: observable lifecycle and counters

pub mod config;
pub mod correlator;
pub mod events;
pub mod health;
pub mod metrics;
#[allow(clippy::module_inception)]
pub mod pool;
pub mod queue;
pub mod session;

// Re-exports for convenient access
pub use config::{CallConfig, ConfigError, HealthConfig, PoolConfig};
pub use correlator::{CallError, RpcCorrelator, MAX_CORRELATION_ID};
pub use events::{PoolEvent, RemovalReason};
pub use health::{
    AggregatedHealthStats, AlertKind, AlertSeverity, HealthAlert, HealthCheckResult,
    HealthMetrics, HealthMonitor, HealthTier, Trend,
};
pub use pool::{
    BatchRequest, ConnectionPool, ErrorKind, ExecuteOptions, PoolError, PoolResult,
    PoolStatistics, PoolStatus, SessionLease,
};
pub use session::{PooledSession, SessionHandle, SessionId, SessionInfo};
