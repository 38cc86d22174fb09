// ABOUTME: Health monitoring for pooled daemon sessions with latency tiers and trend analysis
// ABOUTME: Background probe loop that records per-session metrics and raises alerts on tier changes

//! Health monitoring for the connection pool.
//!
//! The `HealthMonitor` probes every registered session with a cheap daemon method
//! (`ping` by default) at a fixed interval and:
//! - Classifies each probe into a [`HealthTier`] by latency
//! - Keeps a bounded latency history and derives a [`Trend`] from it
//! - Raises a [`HealthAlert`] when a session changes tier or a probe is abnormally slow
//! - Hands each cycle's results to the pool, which owns every eviction decision
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     HealthMonitor                        │
//! │                                                          │
//! │  ┌──────────────┐    ┌──────────────┐                   │
//! │  │ Probe Loop   │───▶│ join_all(    │                   │
//! │  │ (interval)   │    │  probes)     │                   │
//! │  └──────────────┘    └──────┬───────┘                   │
//! │                             │                            │
//! │              ┌──────────────┼──────────────┐             │
//! │              ▼              ▼              ▼             │
//! │      ┌────────────┐ ┌────────────┐ ┌──────────────┐     │
//! │      │ Metrics &  │ │ Alerts     │ │ Cycle results│     │
//! │      │ trend      │ │ (broadcast)│ │ (to pool)    │     │
//! │      └────────────┘ └────────────┘ └──────────────┘     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A cycle finishes every probe before the next one starts, so probes of the same
//! session never overlap.
//!
//! # Usage
//!
//! ```ignore
//! let monitor = Arc::new(HealthMonitor::from_config(&pool_config));
//! let mut cycles = monitor.start_monitoring(sessions);
//! let mut alerts = monitor.subscribe_alerts();
//!
//! while let Some(results) = cycles.recv().await {
//!     // apply results
//! }
//!
//! monitor.stop_monitoring().await;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::{HealthConfig, PoolConfig};
use super::session::{PooledSession, SessionHandle, SessionId};

const ALERT_CHANNEL_CAPACITY: usize = 256;

// === Health Tier ===

/// Classification of one session's most recent probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTier {
    /// Probe answered within the healthy latency
    Healthy,
    /// Probe answered, but slower than healthy
    Degraded,
    /// Probe failed, timed out, or was slower than degraded
    Unhealthy,
    /// Not probed yet
    Unknown,
}

impl HealthTier {
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for HealthTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Direction of recent latency samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
    Unknown,
}

// === Alerts ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Unhealthy,
    Degraded,
    Recovered,
    LatencySpike,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Raised on a tier transition or an abnormally slow probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthAlert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub session_id: SessionId,
    pub message: String,
    pub latency: Option<Duration>,
    pub raised_at: DateTime<Utc>,
}

// === Check Results ===

/// Outcome of probing one session once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheckResult {
    pub session_id: SessionId,
    pub tier: HealthTier,
    pub previous: HealthTier,
    /// Set when the probe answered successfully
    pub latency: Option<Duration>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Rolling health record of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthMetrics {
    pub session_id: SessionId,
    pub tier: HealthTier,
    pub trend: Trend,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_latency: Option<Duration>,
    pub average_latency: Option<Duration>,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
    latency_history: VecDeque<Duration>,
    #[serde(skip)]
    history_size: usize,
}

impl HealthMetrics {
    fn new(session_id: SessionId, history_size: usize) -> Self {
        Self {
            session_id,
            tier: HealthTier::Unknown,
            trend: Trend::Unknown,
            total_checks: 0,
            successful_checks: 0,
            failed_checks: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_latency: None,
            average_latency: None,
            last_error: None,
            last_checked: None,
            latency_history: VecDeque::with_capacity(history_size),
            history_size,
        }
    }

    /// Latency samples, oldest first.
    pub fn latency_history(&self) -> impl Iterator<Item = Duration> + '_ {
        self.latency_history.iter().copied()
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            return 0.0;
        }
        self.successful_checks as f64 / self.total_checks as f64
    }

    fn record_success(&mut self, latency: Duration, tier: HealthTier, config: &HealthConfig) {
        self.total_checks += 1;
        self.successful_checks += 1;
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
        self.last_latency = Some(latency);
        self.last_error = None;
        self.tier = tier;
        self.last_checked = Some(Utc::now());

        if self.latency_history.len() >= self.history_size {
            self.latency_history.pop_front();
        }
        self.latency_history.push_back(latency);

        self.average_latency = mean(self.latency_history.iter().copied());
        self.trend = compute_trend(&self.latency_history, config);
    }

    fn record_failure(&mut self, error: String) {
        self.total_checks += 1;
        self.failed_checks += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
        self.last_error = Some(error);
        self.tier = HealthTier::Unhealthy;
        self.last_checked = Some(Utc::now());
    }
}

/// Pool-wide summary across every monitored session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedHealthStats {
    pub total_sessions: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub average_latency: Option<Duration>,
    pub total_checks: u64,
    pub success_rate: f64,
    pub overall: HealthTier,
}

// === Classification ===

/// Map a successful probe's latency onto a tier.
pub fn classify_latency(latency: Duration, config: &HealthConfig) -> HealthTier {
    if latency <= config.healthy_latency {
        HealthTier::Healthy
    } else if latency <= config.degraded_latency {
        HealthTier::Degraded
    } else {
        HealthTier::Unhealthy
    }
}

/// Compare the mean of the older half of the window with the newer half.
///
/// Fewer than three samples is not enough to call a direction.
#[allow(clippy::cast_precision_loss)]
pub fn compute_trend(history: &VecDeque<Duration>, config: &HealthConfig) -> Trend {
    if history.len() < 3 {
        return Trend::Unknown;
    }

    let split = history.len() / 2;
    let older = mean(history.iter().take(split).copied());
    let newer = mean(history.iter().skip(split).copied());
    let (Some(older), Some(newer)) = (older, newer) else {
        return Trend::Unknown;
    };

    let older = older.as_secs_f64();
    if older <= f64::EPSILON {
        return if newer.is_zero() {
            Trend::Stable
        } else {
            Trend::Degrading
        };
    }

    let change = (newer.as_secs_f64() - older) / older;
    if change <= -config.improving_ratio {
        Trend::Improving
    } else if change >= config.degrading_ratio {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

fn mean(samples: impl Iterator<Item = Duration>) -> Option<Duration> {
    let (sum, count) = samples.fold((Duration::ZERO, 0u32), |(sum, n), d| (sum + d, n + 1));
    (count > 0).then(|| sum / count)
}

// === Health Monitor ===

/// Background health monitor for pooled sessions.
pub struct HealthMonitor {
    config: HealthConfig,

    /// Interval between probe cycles.
    interval: Duration,

    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    metrics: RwLock<HashMap<SessionId, HealthMetrics>>,
    alerts: broadcast::Sender<HealthAlert>,

    /// Shutdown flag for graceful termination.
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,

    /// Handle to the background monitoring task.
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    #[must_use]
    pub fn new(config: HealthConfig, interval: Duration) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            config,
            interval,
            sessions: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            alerts,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            handle: Mutex::new(None),
        }
    }

    /// Create a health monitor from pool configuration.
    #[must_use]
    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.health.clone(), config.health_check_interval)
    }

    /// Register `sessions` and start the probe loop.
    ///
    /// Each completed cycle is delivered on the returned channel. The loop stops on
    /// [`stop_monitoring`](Self::stop_monitoring), when the receiver is dropped, or when
    /// the monitor itself is dropped.
    pub fn start_monitoring(
        self: &Arc<Self>,
        sessions: Vec<SessionHandle>,
    ) -> mpsc::UnboundedReceiver<Vec<HealthCheckResult>> {
        for session in sessions {
            self.add_connection(session);
        }

        self.shutdown.store(false, Ordering::SeqCst);
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::monitor_loop(
            Arc::downgrade(self),
            results_tx,
            self.interval,
            Arc::clone(&self.shutdown),
            Arc::clone(&self.wake),
        ));

        if let Some(previous) = self.handle_guard().replace(handle) {
            previous.abort();
        }
        info!(interval_ms = %self.interval.as_millis(), "Health monitor started");
        results_rx
    }

    /// Stop the probe loop gracefully.
    pub async fn stop_monitoring(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();

        let handle = self.handle_guard().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Health monitor did not stop in time, aborting");
                abort.abort();
            }
        }

        info!("Health monitor stopped");
    }

    /// Check if the monitor is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle_guard().is_some() && !self.shutdown.load(Ordering::SeqCst)
    }

    fn handle_guard(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a session. Existing metrics are kept.
    pub fn add_connection(&self, session: SessionHandle) {
        let id = session.id();
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, session);
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
            .or_insert_with(|| HealthMetrics::new(id, self.config.history_size));
    }

    /// Stop tracking a session and forget its metrics.
    pub fn remove_connection(&self, id: SessionId) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.metrics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn monitored_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Probe one session once with a single attempt.
    pub async fn check_connection_health(&self, session: &PooledSession) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = session
            .correlator()
            .call_with_attempts(&self.config.probe_method, None, self.config.probe_timeout, 1)
            .await;
        let latency = started.elapsed();

        self.record_probe(session.id(), outcome.map(|_| latency).map_err(|e| e.to_string()))
    }

    /// Check every idle tracked session concurrently.
    ///
    /// Sessions with calls outstanding are skipped for this cycle: the daemon answers one
    /// request per session at a time, so a ping queued behind a call would time that
    /// call. Skipped sessions produce no result and keep their current tier.
    pub async fn check_all_connections(&self) -> Vec<HealthCheckResult> {
        // Snapshot so no lock is held across the probes
        let sessions: Vec<SessionHandle> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.correlator().pending_count() == 0)
            .cloned()
            .collect();

        let busy = self.monitored_count().saturating_sub(sessions.len());
        if busy > 0 {
            debug!(busy, checking = sessions.len(), "Skipping health checks for busy sessions");
        }

        join_all(sessions.iter().map(|s| self.check_connection_health(s))).await
    }

    /// Fold one probe outcome into the session's metrics and raise alerts.
    pub(crate) fn record_probe(
        &self,
        session_id: SessionId,
        outcome: Result<Duration, String>,
    ) -> HealthCheckResult {
        let latency = outcome.as_ref().ok().copied();
        let tier = match latency {
            Some(latency) => classify_latency(latency, &self.config),
            None => HealthTier::Unhealthy,
        };

        let previous = {
            let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
            // Removed while the probe was in flight: report, but do not resurrect
            match metrics.get_mut(&session_id) {
                Some(entry) => {
                    let previous = entry.tier;
                    match &outcome {
                        Ok(latency) => entry.record_success(*latency, tier, &self.config),
                        Err(e) => entry.record_failure(e.clone()),
                    }
                    previous
                }
                None => HealthTier::Unknown,
            }
        };

        for alert in self.alerts_for(session_id, previous, tier, latency) {
            match alert.severity {
                AlertSeverity::Critical | AlertSeverity::High => {
                    error!(session = %session_id, kind = ?alert.kind, "{}", alert.message);
                }
                AlertSeverity::Medium => {
                    warn!(session = %session_id, kind = ?alert.kind, "{}", alert.message);
                }
                AlertSeverity::Low => {
                    info!(session = %session_id, kind = ?alert.kind, "{}", alert.message);
                }
            }
            let _ = self.alerts.send(alert);
        }

        let error = outcome.err();
        if let Some(e) = &error {
            debug!(session = %session_id, error = %e, "Health probe failed");
        }

        HealthCheckResult {
            session_id,
            tier,
            previous,
            latency,
            error,
            checked_at: Utc::now(),
        }
    }

    fn alerts_for(
        &self,
        session_id: SessionId,
        previous: HealthTier,
        tier: HealthTier,
        latency: Option<Duration>,
    ) -> Vec<HealthAlert> {
        let mut alerts = Vec::new();
        let raise = |kind, severity, message: String| HealthAlert {
            kind,
            severity,
            session_id,
            message,
            latency,
            raised_at: Utc::now(),
        };

        if tier != previous {
            match tier {
                HealthTier::Unhealthy => alerts.push(raise(
                    AlertKind::Unhealthy,
                    AlertSeverity::Critical,
                    format!("Session {session_id} became unhealthy"),
                )),
                HealthTier::Degraded => alerts.push(raise(
                    AlertKind::Degraded,
                    AlertSeverity::Medium,
                    format!("Session {session_id} is degraded"),
                )),
                HealthTier::Healthy
                    if matches!(previous, HealthTier::Degraded | HealthTier::Unhealthy) =>
                {
                    alerts.push(raise(
                        AlertKind::Recovered,
                        AlertSeverity::Low,
                        format!("Session {session_id} recovered"),
                    ));
                }
                HealthTier::Healthy | HealthTier::Unknown => {}
            }
        }

        if let Some(latency) = latency {
            let spike = self.config.degraded_latency.mul_f64(self.config.spike_factor);
            if latency > spike {
                alerts.push(raise(
                    AlertKind::LatencySpike,
                    AlertSeverity::Medium,
                    format!(
                        "Session {session_id} probe took {}ms (spike threshold {}ms)",
                        latency.as_millis(),
                        spike.as_millis()
                    ),
                ));
            }
        }

        alerts
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<HealthAlert> {
        self.alerts.subscribe()
    }

    pub fn get_metrics(&self, id: SessionId) -> Option<HealthMetrics> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn all_metrics(&self) -> Vec<HealthMetrics> {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Aggregate individual session metrics into a pool-wide summary.
    #[must_use]
    pub fn aggregated_stats(&self) -> AggregatedHealthStats {
        let metrics = self.all_metrics();
        let count = |tier| metrics.iter().filter(|m| m.tier == tier).count();

        let total_sessions = metrics.len();
        let healthy = count(HealthTier::Healthy);
        let degraded = count(HealthTier::Degraded);
        let unhealthy = count(HealthTier::Unhealthy);
        let unknown = count(HealthTier::Unknown);

        let total_checks: u64 = metrics.iter().map(|m| m.total_checks).sum();
        let successful: u64 = metrics.iter().map(|m| m.successful_checks).sum();
        #[allow(clippy::cast_precision_loss)]
        let success_rate = if total_checks == 0 {
            0.0
        } else {
            successful as f64 / total_checks as f64
        };

        let overall = if total_sessions == 0 || unknown == total_sessions {
            HealthTier::Unknown
        } else if healthy == total_sessions {
            HealthTier::Healthy
        } else if unhealthy == total_sessions {
            HealthTier::Unhealthy
        } else {
            HealthTier::Degraded
        };

        AggregatedHealthStats {
            total_sessions,
            healthy,
            degraded,
            unhealthy,
            unknown,
            average_latency: mean(metrics.iter().filter_map(|m| m.average_latency)),
            total_checks,
            success_rate,
            overall,
        }
    }

    /// The main probe loop running in the background.
    async fn monitor_loop(
        monitor: Weak<Self>,
        results_tx: mpsc::UnboundedSender<Vec<HealthCheckResult>>,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) {
        debug!("Health check loop started");

        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = wake.notified() => {}
            }

            if shutdown.load(Ordering::SeqCst) {
                debug!("Health check loop received shutdown signal");
                break;
            }

            let Some(monitor) = monitor.upgrade() else {
                break;
            };
            let results = monitor.check_all_connections().await;
            drop(monitor);

            let unhealthy = results
                .iter()
                .filter(|r| r.tier == HealthTier::Unhealthy)
                .count();
            if unhealthy > 0 {
                warn!(sessions = results.len(), unhealthy, "Health cycle found unhealthy sessions");
            } else {
                debug!(sessions = results.len(), "Health cycle complete");
            }

            if results_tx.send(results).is_err() {
                break;
            }
        }

        debug!("Health check loop ended");
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        // Signal shutdown on drop
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::config::CallConfig;
    use crate::pool::correlator::RpcCorrelator;
    use crate::testing::MockDaemon;
    use pretty_assertions::assert_eq;

    fn thresholds() -> HealthConfig {
        HealthConfig {
            probe_timeout: Duration::from_millis(300),
            healthy_latency: Duration::from_millis(20),
            degraded_latency: Duration::from_millis(100),
            ..HealthConfig::default()
        }
    }

    fn monitor() -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(thresholds(), Duration::from_millis(50)))
    }

    async fn session(daemon: &Arc<MockDaemon>) -> SessionHandle {
        let correlator = RpcCorrelator::connect(Arc::new(daemon.connector()), CallConfig::default())
            .await
            .unwrap();
        Arc::new(PooledSession::new(correlator))
    }

    fn drain(rx: &mut broadcast::Receiver<HealthAlert>) -> Vec<HealthAlert> {
        let mut out = Vec::new();
        while let Ok(alert) = rx.try_recv() {
            out.push(alert);
        }
        out
    }

    fn history(ms: &[u64]) -> VecDeque<Duration> {
        ms.iter().map(|m| Duration::from_millis(*m)).collect()
    }

    // ==================== Classification Tests ====================

    #[test]
    fn test_classify_latency_boundaries() {
        let config = thresholds();
        assert_eq!(classify_latency(Duration::from_millis(5), &config), HealthTier::Healthy);
        assert_eq!(classify_latency(Duration::from_millis(20), &config), HealthTier::Healthy);
        assert_eq!(classify_latency(Duration::from_millis(21), &config), HealthTier::Degraded);
        assert_eq!(classify_latency(Duration::from_millis(100), &config), HealthTier::Degraded);
        assert_eq!(classify_latency(Duration::from_millis(101), &config), HealthTier::Unhealthy);
    }

    // ==================== Trend Tests ====================

    #[test]
    fn test_trend_needs_three_samples() {
        let config = thresholds();
        assert_eq!(compute_trend(&history(&[10, 50]), &config), Trend::Unknown);
    }

    #[test]
    fn test_trend_directions() {
        let config = thresholds();
        assert_eq!(compute_trend(&history(&[10, 10, 10, 10]), &config), Trend::Stable);
        assert_eq!(compute_trend(&history(&[10, 10, 30, 30]), &config), Trend::Degrading);
        assert_eq!(compute_trend(&history(&[40, 40, 10, 10]), &config), Trend::Improving);
        // 5% rise is within the stable band
        assert_eq!(compute_trend(&history(&[100, 100, 105, 105]), &config), Trend::Stable);
    }

    // ==================== Metrics Tests ====================

    #[tokio::test]
    async fn test_metrics_counters_stay_consistent() {
        let daemon = MockDaemon::new();
        let monitor = monitor();
        let s = session(&daemon).await;
        monitor.add_connection(Arc::clone(&s));

        monitor.record_probe(s.id(), Ok(Duration::from_millis(5)));
        monitor.record_probe(s.id(), Err("boom".to_string()));
        monitor.record_probe(s.id(), Ok(Duration::from_millis(7)));

        let m = monitor.get_metrics(s.id()).unwrap();
        assert_eq!(m.total_checks, 3);
        assert_eq!(m.successful_checks + m.failed_checks, m.total_checks);
        assert_eq!(m.consecutive_successes, 1);
        assert_eq!(m.consecutive_failures, 0);
        assert_eq!(m.latency_history().count(), 2);
        assert_eq!(m.average_latency, Some(Duration::from_millis(6)));
        assert!(m.last_error.is_none());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let daemon = MockDaemon::new();
        let monitor = Arc::new(HealthMonitor::new(
            HealthConfig {
                history_size: 3,
                ..thresholds()
            },
            Duration::from_secs(60),
        ));
        let s = session(&daemon).await;
        monitor.add_connection(Arc::clone(&s));

        for ms in [1, 2, 3, 4, 5] {
            monitor.record_probe(s.id(), Ok(Duration::from_millis(ms)));
        }

        let m = monitor.get_metrics(s.id()).unwrap();
        let kept: Vec<u128> = m.latency_history().map(|d| d.as_millis()).collect();
        assert_eq!(kept, vec![3, 4, 5]);
    }

    // ==================== Alert Tests ====================

    #[tokio::test]
    async fn test_degraded_alert_fires_once() {
        let daemon = MockDaemon::new();
        let monitor = monitor();
        let mut alerts = monitor.subscribe_alerts();
        let s = session(&daemon).await;
        monitor.add_connection(Arc::clone(&s));

        for _ in 0..3 {
            let result = monitor.record_probe(s.id(), Ok(Duration::from_millis(50)));
            assert_eq!(result.tier, HealthTier::Degraded);
        }

        let raised = drain(&mut alerts);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, AlertKind::Degraded);
        assert_eq!(raised[0].severity, AlertSeverity::Medium);
    }

    #[tokio::test]
    async fn test_transition_alerts() {
        let daemon = MockDaemon::new();
        let monitor = monitor();
        let mut alerts = monitor.subscribe_alerts();
        let s = session(&daemon).await;
        monitor.add_connection(Arc::clone(&s));

        // Unknown -> Healthy is silent
        monitor.record_probe(s.id(), Ok(Duration::from_millis(1)));
        assert!(drain(&mut alerts).is_empty());

        monitor.record_probe(s.id(), Err("timeout".to_string()));
        let raised = drain(&mut alerts);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, AlertKind::Unhealthy);
        assert_eq!(raised[0].severity, AlertSeverity::Critical);

        monitor.record_probe(s.id(), Ok(Duration::from_millis(1)));
        let raised = drain(&mut alerts);
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, AlertKind::Recovered);
        assert_eq!(raised[0].severity, AlertSeverity::Low);
    }

    #[tokio::test]
    async fn test_latency_spike_alert() {
        let daemon = MockDaemon::new();
        let monitor = monitor();
        let mut alerts = monitor.subscribe_alerts();
        let s = session(&daemon).await;
        monitor.add_connection(Arc::clone(&s));

        // Above 1.5x the degraded threshold
        let result = monitor.record_probe(s.id(), Ok(Duration::from_millis(200)));
        assert_eq!(result.tier, HealthTier::Unhealthy);

        let kinds: Vec<AlertKind> = drain(&mut alerts).into_iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::Unhealthy, AlertKind::LatencySpike]);
    }

    #[tokio::test]
    async fn test_removed_session_is_not_resurrected() {
        let daemon = MockDaemon::new();
        let monitor = monitor();
        let s = session(&daemon).await;
        monitor.add_connection(Arc::clone(&s));
        monitor.remove_connection(s.id());

        let result = monitor.record_probe(s.id(), Ok(Duration::from_millis(1)));
        assert_eq!(result.previous, HealthTier::Unknown);
        assert!(monitor.get_metrics(s.id()).is_none());
    }

    // ==================== Probe Tests ====================

    #[tokio::test]
    async fn test_probe_against_daemon() {
        let daemon = MockDaemon::new();
        let monitor = monitor();
        let s = session(&daemon).await;
        monitor.add_connection(Arc::clone(&s));

        let result = monitor.check_connection_health(&s).await;
        assert_eq!(result.tier, HealthTier::Healthy);
        assert!(result.latency.is_some());
        assert_eq!(daemon.requests("ping"), 1);
    }

    #[tokio::test]
    async fn test_probe_timeout_is_unhealthy() {
        let daemon = MockDaemon::new();
        daemon.hang("ping");
        let monitor = monitor();
        let s = session(&daemon).await;
        monitor.add_connection(Arc::clone(&s));

        let result = monitor.check_connection_health(&s).await;
        assert_eq!(result.tier, HealthTier::Unhealthy);
        assert!(result.latency.is_none());
        assert!(result.error.unwrap().contains("timed out"));
        // Probes never retry
        assert_eq!(daemon.requests("ping"), 1);
    }

    #[tokio::test]
    async fn test_aggregated_stats() {
        let daemon = MockDaemon::new();
        let monitor = monitor();
        let a = session(&daemon).await;
        let b = session(&daemon).await;
        monitor.add_connection(Arc::clone(&a));
        monitor.add_connection(Arc::clone(&b));

        let stats = monitor.aggregated_stats();
        assert_eq!(stats.overall, HealthTier::Unknown);
        assert_eq!(stats.unknown, 2);

        monitor.record_probe(a.id(), Ok(Duration::from_millis(4)));
        monitor.record_probe(b.id(), Err("down".to_string()));

        let stats = monitor.aggregated_stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.healthy, 1);
        assert_eq!(stats.unhealthy, 1);
        assert_eq!(stats.overall, HealthTier::Degraded);
        assert_eq!(stats.total_checks, 2);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.average_latency, Some(Duration::from_millis(4)));
    }

    #[tokio::test]
    async fn test_busy_sessions_skip_health_check() {
        let daemon = MockDaemon::new();
        daemon.hang("goxel.render");
        let monitor = monitor();
        let busy = session(&daemon).await;
        let idle = session(&daemon).await;
        monitor.add_connection(Arc::clone(&busy));
        monitor.add_connection(Arc::clone(&idle));

        let render = {
            let busy = Arc::clone(&busy);
            tokio::spawn(async move {
                busy.correlator()
                    .call("goxel.render", None, Some(Duration::from_secs(5)))
                    .await
            })
        };
        for _ in 0..100 {
            if busy.correlator().pending_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(busy.correlator().pending_count(), 1);

        let results = monitor.check_all_connections().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].session_id, idle.id());
        assert_eq!(daemon.requests("ping"), 1);
        assert_eq!(monitor.get_metrics(busy.id()).unwrap().total_checks, 0);

        render.abort();
    }

    // ==================== Start/Stop Tests ====================

    #[tokio::test]
    async fn test_monitoring_delivers_cycles() {
        let daemon = MockDaemon::new();
        let monitor = monitor();
        let s = session(&daemon).await;

        let mut cycles = monitor.start_monitoring(vec![Arc::clone(&s)]);
        assert!(monitor.is_running());

        let results = tokio::time::timeout(Duration::from_secs(2), cycles.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].session_id, s.id());

        monitor.stop_monitoring().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_prompt() {
        let monitor = Arc::new(HealthMonitor::new(thresholds(), Duration::from_secs(3600)));
        let _cycles = monitor.start_monitoring(Vec::new());

        let started = Instant::now();
        monitor.stop_monitoring().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
