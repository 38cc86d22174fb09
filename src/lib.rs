// ABOUTME: Library crate for the Goxel daemon client: connection pool, RPC correlation and health monitoring

#![allow(missing_docs)]

pub mod config;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{ClientConfig, DaemonConfig};
pub use logging::LoggingConfig;
pub use pool::{
    AggregatedHealthStats, AlertKind, AlertSeverity, BatchRequest, CallConfig, CallError,
    ConfigError, ConnectionPool, ErrorKind, ExecuteOptions, HealthAlert, HealthCheckResult,
    HealthConfig, HealthMetrics, HealthMonitor, HealthTier, PoolConfig, PoolError, PoolEvent,
    PoolResult, PoolStatistics, PoolStatus, PooledSession, RemovalReason, RpcCorrelator,
    SessionId, SessionInfo, SessionLease, Trend,
};
pub use transport::{Connector, MessageSink, TransportError, TransportEvent, TransportLink, UnixSocketConnector};
