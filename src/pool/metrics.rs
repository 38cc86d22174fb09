// ABOUTME: Counters for the connection pool
//
// Tracks:
// - Calls: total, failed, cumulative latency
// - Sessions: created, evicted, rotated, idle-closed
// - Demand queue: queued, timed out

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::events::RemovalReason;

/// Pool-level counters
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub total_latency_micros: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_evicted: AtomicU64,
    pub sessions_rotated: AtomicU64,
    pub sessions_idle_closed: AtomicU64,
    pub demands_queued: AtomicU64,
    pub demands_timed_out: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_succeeded(&self, latency: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_micros.fetch_add(
            u64::try_from(latency.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub fn request_failed(&self, latency: Duration) {
        self.request_succeeded(latency);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_removed(&self, reason: RemovalReason) {
        let counter = match reason {
            RemovalReason::Rotated => &self.sessions_rotated,
            RemovalReason::Idle => &self.sessions_idle_closed,
            RemovalReason::Unhealthy | RemovalReason::ConnectionLost => &self.sessions_evicted,
            RemovalReason::Shutdown => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn demand_queued(&self) {
        self.demands_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn demand_timed_out(&self) {
        self.demands_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Mean latency over every completed call.
    pub fn average_latency(&self) -> Duration {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_latency_micros.load(Ordering::Relaxed) / total)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.failed_requests.load(Ordering::Relaxed) as f64 / total as f64
    }
}
