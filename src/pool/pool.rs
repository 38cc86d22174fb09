// ABOUTME: Connection pool managing daemon sessions with load balancing and FIFO demand queueing
// ABOUTME: Owns acquire/release, scaling between min and max, rotation, eviction and shutdown

//! Connection pool for the Goxel daemon.
//!
//! The `ConnectionPool` manages a bounded set of [`PooledSession`]s, providing:
//! - Acquire/release with least-used selection, healthy sessions before degraded ones
//! - Growth up to `max_connections`, then a bounded FIFO of waiting callers
//! - Rotation after `max_requests_per_connection` calls
//! - Eviction on persistent unhealthiness or transport loss, with replacement to `min_connections`
//!   and extra sessions for queued callers while below `max_connections`
//! - Idle shrink back towards `min_connections`
//! - Graceful shutdown that fails every waiter
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ConnectionPool                         │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │  state: Mutex<PoolState>                              │  │
//! │  │     slots:  [session A (busy), session B (free), ..]  │  │
//! │  │     queue:  [waiter 1, waiter 2, ..]  (FIFO)          │  │
//! │  │     status: ready | degraded | shutdown               │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! │                                                             │
//! │  ┌───────────────┐  ┌───────────────┐  ┌────────────────┐  │
//! │  │ HealthMonitor │  │  PoolMetrics  │  │ PoolEvent bus  │  │
//! │  │ (probe cycles)│  │  (counters)   │  │  (broadcast)   │  │
//! │  └───────────────┘  └───────────────┘  └────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The state lock is never held across an `.await`. Work that must suspend (opening a
//! replacement, closing a retired session) is decided under the lock and carried out
//! after it is released.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use goxel_pool::{ConnectionPool, PoolConfig, UnixSocketConnector};
//!
//! let connector = Arc::new(UnixSocketConnector::new("/tmp/goxel.sock"));
//! let pool = ConnectionPool::new(PoolConfig::default(), connector)?;
//! pool.initialize().await?;
//!
//! let status = pool.execute("goxel.get_status", None).await?;
//!
//! pool.shutdown().await?;
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::{ConfigError, PoolConfig};
use super::correlator::{CallError, RpcCorrelator};
use super::events::{PoolEvent, RemovalReason};
use super::health::{HealthAlert, HealthCheckResult, HealthMonitor, HealthTier};
use super::metrics::PoolMetrics;
use super::queue::{DemandQueue, QueueFull};
use super::session::{PooledSession, SessionHandle, SessionId, SessionInfo};
use crate::transport::Connector;

const EVENT_CHANNEL_CAPACITY: usize = 256;

// === Pool Errors ===

/// User-visible failure class of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The daemon answered with a structured error
    Protocol,
    Timeout,
    Connection,
    Configuration,
    Shutdown,
}

/// Errors that can occur during pool operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A session could not be opened
    #[error("Connection error: {0}")]
    Connection(String),

    /// No session became available in time
    #[error("Timed out waiting for a session after {0:?}")]
    Timeout(Duration),

    /// Pool is shut down, or shut down while the caller was waiting
    #[error("Pool shutdown")]
    Shutdown,

    /// The delegated call failed
    #[error(transparent)]
    Call(#[from] CallError),

    /// Initialize called twice
    #[error("Pool is already initialized")]
    AlreadyInitialized,

    /// Operation requires an initialized pool
    #[error("Pool is not initialized")]
    NotInitialized,
}

impl PoolError {
    /// Collapse into the class a caller reacts to.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::AlreadyInitialized => ErrorKind::Configuration,
            Self::Connection(_) | Self::NotInitialized => ErrorKind::Connection,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Shutdown => ErrorKind::Shutdown,
            Self::Call(call) => match call {
                CallError::Timeout { .. } => ErrorKind::Timeout,
                CallError::Rpc { .. } => ErrorKind::Protocol,
                CallError::ConnectionLost | CallError::NotConnected | CallError::Transport(_) => {
                    ErrorKind::Connection
                }
            },
        }
    }
}

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

// === Status & Reporting ===

/// Pool-wide status: `initializing -> ready <-> degraded`, `shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Initializing,
    Ready,
    Degraded,
    Shutdown,
}

/// Per-request overrides of the call policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub timeout: Option<Duration>,
    pub max_attempts: Option<u32>,
}

/// One element of [`ConnectionPool::execute_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub method: String,
    pub params: Option<Value>,
    pub options: ExecuteOptions,
}

impl BatchRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            options: ExecuteOptions::default(),
        }
    }
}

/// Derived snapshot of pool counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatistics {
    pub status: PoolStatus,
    pub total_sessions: usize,
    pub available_sessions: usize,
    pub busy_sessions: usize,
    pub healthy_sessions: usize,
    pub pending_creations: usize,
    pub queue_size: usize,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub average_latency: Duration,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
    pub sessions_rotated: u64,
    pub sessions_idle_closed: u64,
    pub demands_queued: u64,
    pub demands_timed_out: u64,
    pub uptime: Duration,
}

// === Internal State ===

/// Pool-side bookkeeping for one session.
struct SessionSlot {
    session: SessionHandle,
    health: HealthTier,
    request_count: u64,
    last_used: Instant,
    available: bool,
    /// Evicted as soon as the current call returns
    retiring: bool,
    unhealthy_streak: u32,
}

impl SessionSlot {
    fn new(session: SessionHandle, available: bool) -> Self {
        Self {
            session,
            health: HealthTier::Healthy,
            request_count: 0,
            last_used: Instant::now(),
            available,
            retiring: false,
            unhealthy_streak: 0,
        }
    }

    /// Selection rank when the session can take work: healthy first, then degraded.
    fn serve_rank(&self) -> Option<u8> {
        if !self.available || self.retiring || !self.session.is_connected() {
            return None;
        }
        match self.health {
            HealthTier::Healthy => Some(0),
            HealthTier::Degraded | HealthTier::Unknown => Some(1),
            HealthTier::Unhealthy => None,
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.session.id(),
            created_at: self.session.created_at(),
            age: self.session.age(),
            health: self.health,
            request_count: self.request_count,
            idle_for: self.last_used.elapsed(),
            available: self.available,
            connected: self.session.is_connected(),
            pending_calls: self.session.correlator().pending_count(),
        }
    }
}

struct PoolState {
    status: PoolStatus,
    initializing: bool,
    slots: Vec<SessionSlot>,
    queue: DemandQueue<SessionLease, PoolError>,
    /// Session creations in flight; counted against `max_connections`
    creating: usize,
}

impl PoolState {
    fn position(&self, id: SessionId) -> Option<usize> {
        self.slots.iter().position(|s| s.session.id() == id)
    }

    fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.retiring).count()
    }
}

/// Work decided under the state lock and performed after it is released.
#[derive(Default)]
struct FollowUp {
    events: Vec<PoolEvent>,
    close: Vec<(SessionHandle, RemovalReason)>,
    replacements: usize,
}

enum AcquireStep {
    Grow,
    Wait {
        id: Uuid,
        rx: oneshot::Receiver<PoolResult<SessionLease>>,
        queue_size: usize,
    },
    Backoff,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    monitor: Arc<HealthMonitor>,
    metrics: PoolMetrics,
    events: broadcast::Sender<PoolEvent>,
    started_at: Instant,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Holds one unit of `PoolState::creating` and gives it back on drop.
struct CreationSlot {
    inner: Arc<PoolInner>,
}

impl Drop for CreationSlot {
    fn drop(&mut self) {
        let mut state = self.inner.lock_state();
        state.creating = state.creating.saturating_sub(1);
    }
}

// === Session Lease ===

/// Exclusive use of one session. Returned to the pool on [`release`](Self::release) or drop.
pub struct SessionLease {
    pool: Arc<PoolInner>,
    session: SessionHandle,
    released: bool,
}

impl SessionLease {
    fn new(pool: Arc<PoolInner>, session: SessionHandle) -> Self {
        Self {
            pool,
            session,
            released: false,
        }
    }

    pub fn session(&self) -> &PooledSession {
        &self.session
    }

    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    pub fn release(mut self) {
        self.released = true;
        self.pool.release(self.session.id());
    }

    /// Drop without touching pool state. Used when handing over failed under the lock.
    fn disarm(mut self) {
        self.released = true;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(self.session.id());
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session", &self.session.id())
            .field("released", &self.released)
            .finish()
    }
}

/// Spawn on the current runtime if there is one.
fn spawn_detached<F>(future: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => debug!("No runtime available for background pool work"),
    }
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn open_session(&self) -> PoolResult<SessionHandle> {
        let correlator = RpcCorrelator::connect(Arc::clone(&self.connector), self.config.call.clone())
            .await
            .map_err(|e| PoolError::Connection(e.to_string()))?;
        Ok(Arc::new(PooledSession::new(correlator)))
    }

    // === Selection ===

    /// Healthy sessions are preferred. Degraded ones serve only when no healthy one is free.
    fn select(&self, state: &PoolState) -> Option<usize> {
        let candidates = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.serve_rank().map(|rank| (index, rank, slot)));

        // min_by_key keeps the first of equal minima
        if self.config.load_balancing {
            candidates
                .min_by_key(|(_, rank, slot)| (*rank, slot.request_count))
                .map(|(index, _, _)| index)
        } else {
            candidates
                .min_by_key(|(_, rank, _)| *rank)
                .map(|(index, _, _)| index)
        }
    }

    fn checkout(self: &Arc<Self>, state: &mut PoolState, index: usize) -> SessionLease {
        let slot = &mut state.slots[index];
        slot.available = false;
        slot.request_count += 1;
        slot.last_used = Instant::now();
        SessionLease::new(Arc::clone(self), Arc::clone(&slot.session))
    }

    fn take_available(self: &Arc<Self>, state: &mut PoolState) -> Option<SessionLease> {
        let index = self.select(state)?;
        Some(self.checkout(state, index))
    }

    /// Serve queued waiters in arrival order while sessions are free.
    fn drain_queue(self: &Arc<Self>, state: &mut PoolState, follow: &mut FollowUp) {
        while !state.queue.is_empty() {
            let Some(index) = self.select(state) else {
                break;
            };
            let Some(entry) = state.queue.pop_front() else {
                break;
            };

            let waited = entry.enqueued_at.elapsed();
            if entry.deadline <= Instant::now() {
                // Its own timer has not fired yet
                self.metrics.demand_timed_out();
                entry.abort(PoolError::Timeout(waited));
                continue;
            }
            let lease = self.checkout(state, index);
            let session_id = lease.id();
            match entry.fulfill(lease) {
                Ok(()) => {
                    debug!(session = %session_id, waited_ms = waited.as_millis(), "Queued demand served");
                    follow.events.push(PoolEvent::DemandServed {
                        session_id,
                        queue_size: state.queue.len(),
                    });
                }
                Err(lease) => {
                    // Waiter left between pop and send
                    let slot = &mut state.slots[index];
                    slot.available = true;
                    slot.request_count = slot.request_count.saturating_sub(1);
                    lease.disarm();
                }
            }
        }
    }

    /// Reserve replacements until open plus in-flight sessions reach the minimum, then
    /// for queued waiters not already covered by an in-flight creation, up to the maximum.
    fn plan_top_up(&self, state: &mut PoolState, follow: &mut FollowUp) {
        if !matches!(state.status, PoolStatus::Ready | PoolStatus::Degraded) {
            return;
        }
        while state.slots.len() + state.creating < self.config.min_connections {
            state.creating += 1;
            follow.replacements += 1;
        }

        let uncovered = state.queue.len().saturating_sub(state.creating);
        let headroom = self
            .config
            .max_connections
            .saturating_sub(state.slots.len() + state.creating);
        let extra = uncovered.min(headroom);
        if extra > 0 {
            debug!(extra, queued = state.queue.len(), "Opening sessions for queued demand");
            state.creating += extra;
            follow.replacements += extra;
        }
    }

    // === Follow-up Work ===

    fn run_follow_up(self: &Arc<Self>, follow: FollowUp) {
        for event in follow.events {
            self.emit(event);
        }

        for (session, reason) in follow.close {
            let session_id = session.id();
            self.monitor.remove_connection(session_id);
            self.metrics.session_removed(reason);
            info!(session = %session_id, %reason, "Session removed from pool");
            self.emit(PoolEvent::SessionRemoved { session_id, reason });

            spawn_detached(async move {
                if let Err(e) = session.correlator().close().await {
                    debug!(session = %session_id, error = %e, "Error closing session");
                }
            });
        }

        for _ in 0..follow.replacements {
            self.spawn_replacement();
        }
    }

    fn spawn_replacement(self: &Arc<Self>) {
        let reservation = CreationSlot {
            inner: Arc::clone(self),
        };
        let inner = Arc::clone(self);

        // The reservation travels with the future, so an unspawned or aborted task still returns it
        spawn_detached(async move {
            let _reservation = reservation;
            match inner.open_session().await {
                Ok(session) => {
                    if let Err(e) = inner.register(session, false) {
                        debug!(error = %e, "Replacement session discarded");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to open replacement session");
                    inner.emit(PoolEvent::Error {
                        message: e.to_string(),
                    });
                }
            }
        });
    }

    /// Add a freshly opened session. With `lease_to_caller` it is handed out busy.
    fn register(
        self: &Arc<Self>,
        session: SessionHandle,
        lease_to_caller: bool,
    ) -> PoolResult<Option<SessionLease>> {
        let mut follow = FollowUp::default();
        let lease = {
            let mut state = self.lock_state();
            if state.status == PoolStatus::Shutdown {
                drop(state);
                spawn_detached(async move {
                    let _ = session.correlator().close().await;
                });
                return Err(PoolError::Shutdown);
            }

            state
                .slots
                .push(SessionSlot::new(Arc::clone(&session), !lease_to_caller));
            if lease_to_caller {
                let index = state.slots.len() - 1;
                Some(self.checkout(&mut state, index))
            } else {
                self.drain_queue(&mut state, &mut follow);
                None
            }
        };

        self.metrics.session_created();
        self.monitor.add_connection(Arc::clone(&session));
        self.watch_connectivity(&session);
        info!(session = %session.id(), "Session added to pool");
        follow.events.insert(
            0,
            PoolEvent::SessionAdded {
                session_id: session.id(),
            },
        );
        self.run_follow_up(follow);
        Ok(lease)
    }

    /// Evict the session as soon as its transport reports loss.
    fn watch_connectivity(self: &Arc<Self>, session: &PooledSession) {
        let mut connectivity = session.correlator().connectivity();
        let session_id = session.id();
        let pool = Arc::downgrade(self);

        spawn_detached(async move {
            loop {
                if !*connectivity.borrow_and_update() {
                    break;
                }
                if connectivity.changed().await.is_err() {
                    break;
                }
            }
            if let Some(inner) = pool.upgrade() {
                inner.handle_session_lost(session_id);
            }
        });
    }

    fn handle_session_lost(self: &Arc<Self>, session_id: SessionId) {
        let mut follow = FollowUp::default();
        {
            let mut state = self.lock_state();
            if state.status == PoolStatus::Shutdown {
                return;
            }
            let Some(index) = state.position(session_id) else {
                return;
            };
            let slot = state.slots.remove(index);
            follow.close.push((slot.session, RemovalReason::ConnectionLost));
            self.plan_top_up(&mut state, &mut follow);
        }

        warn!(session = %session_id, replacements = follow.replacements, "Session lost its transport");
        self.run_follow_up(follow);
    }

    // === Release ===

    fn release(self: &Arc<Self>, session_id: SessionId) {
        let mut follow = FollowUp::default();
        {
            let mut state = self.lock_state();
            if state.status == PoolStatus::Shutdown {
                return;
            }

            if let Some(index) = state.position(session_id) {
                let len = state.slots.len();
                let slot = &mut state.slots[index];
                slot.available = true;
                slot.last_used = Instant::now();

                let retire = if slot.request_count >= self.config.max_requests_per_connection {
                    Some(RemovalReason::Rotated)
                } else if std::mem::take(&mut slot.retiring) && len > self.config.min_connections {
                    Some(RemovalReason::Unhealthy)
                } else {
                    None
                };

                if let Some(reason) = retire {
                    let slot = state.slots.remove(index);
                    debug!(
                        session = %session_id,
                        requests = slot.request_count,
                        %reason,
                        "Retiring session on release"
                    );
                    follow.close.push((slot.session, reason));
                    if reason == RemovalReason::Rotated {
                        state.creating += 1;
                        follow.replacements += 1;
                    }
                    self.plan_top_up(&mut state, &mut follow);
                }
            }

            self.drain_queue(&mut state, &mut follow);
        }
        self.run_follow_up(follow);
    }

    // === Health Cycle ===

    fn apply_health_cycle(self: &Arc<Self>, results: &[HealthCheckResult]) {
        let mut follow = FollowUp::default();
        {
            let mut state = self.lock_state();
            if state.status == PoolStatus::Shutdown {
                return;
            }

            for result in results {
                let Some(slot) = state
                    .slots
                    .iter_mut()
                    .find(|s| s.session.id() == result.session_id)
                else {
                    continue;
                };
                if slot.health != result.tier {
                    follow.events.push(PoolEvent::SessionHealthChanged {
                        session_id: result.session_id,
                        from: slot.health,
                        to: result.tier,
                    });
                    slot.health = result.tier;
                }
                if result.tier == HealthTier::Unhealthy {
                    slot.unhealthy_streak = slot.unhealthy_streak.saturating_add(1);
                } else {
                    slot.unhealthy_streak = 0;
                    slot.retiring = false;
                }
            }

            self.evict_unhealthy(&mut state, &mut follow);
            self.shrink_idle(&mut state, &mut follow);
            self.plan_top_up(&mut state, &mut follow);
            self.refresh_status(&mut state, &mut follow);
            self.drain_queue(&mut state, &mut follow);
        }
        self.run_follow_up(follow);
    }

    /// Remove sessions unhealthy for `unhealthy_threshold` cycles without going below the minimum.
    fn evict_unhealthy(&self, state: &mut PoolState, follow: &mut FollowUp) {
        let threshold = self.config.unhealthy_threshold;
        let mut remaining = state.active_count();
        let mut index = 0;

        while index < state.slots.len() {
            let slot = &state.slots[index];
            let due = slot.health == HealthTier::Unhealthy
                && slot.unhealthy_streak >= threshold
                && !slot.retiring;

            if due && remaining > self.config.min_connections {
                remaining -= 1;
                if slot.available {
                    let slot = state.slots.remove(index);
                    warn!(session = %slot.session.id(), "Evicting unhealthy session");
                    follow.close.push((slot.session, RemovalReason::Unhealthy));
                    continue;
                }
                state.slots[index].retiring = true;
            }
            index += 1;
        }
    }

    /// Close sessions idle past `idle_timeout` while above the minimum.
    fn shrink_idle(&self, state: &mut PoolState, follow: &mut FollowUp) {
        let mut remaining = state.active_count();
        let mut index = 0;

        while index < state.slots.len() {
            let slot = &state.slots[index];
            let idle = slot.available
                && !slot.retiring
                && slot.last_used.elapsed() >= self.config.idle_timeout;

            if idle && remaining > self.config.min_connections {
                remaining -= 1;
                let slot = state.slots.remove(index);
                debug!(session = %slot.session.id(), "Closing idle session");
                follow.close.push((slot.session, RemovalReason::Idle));
                continue;
            }
            index += 1;
        }
    }

    /// At least 80% healthy is ready, anything less is degraded.
    fn refresh_status(&self, state: &mut PoolState, follow: &mut FollowUp) {
        let total = state.slots.len();
        let healthy = state
            .slots
            .iter()
            .filter(|s| s.health.is_healthy())
            .count();

        let next = if total > 0 && healthy * 5 >= total * 4 {
            PoolStatus::Ready
        } else {
            PoolStatus::Degraded
        };
        if next == state.status {
            return;
        }

        state.status = next;
        match next {
            PoolStatus::Ready => {
                info!(healthy, total, "Pool ready");
                follow.events.push(PoolEvent::Ready { sessions: total });
            }
            _ => {
                warn!(healthy, total, "Pool degraded");
                follow.events.push(PoolEvent::Degraded { healthy, total });
            }
        }
    }

    // === Acquire ===

    async fn acquire_within(self: &Arc<Self>, timeout: Duration) -> PoolResult<SessionLease> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let step = {
                let mut state = self.lock_state();
                match state.status {
                    PoolStatus::Shutdown => return Err(PoolError::Shutdown),
                    PoolStatus::Initializing => return Err(PoolError::NotInitialized),
                    PoolStatus::Ready | PoolStatus::Degraded => {}
                }

                if let Some(lease) = self.take_available(&mut state) {
                    return Ok(lease);
                }

                if state.slots.len() + state.creating < self.config.max_connections {
                    state.creating += 1;
                    AcquireStep::Grow
                } else {
                    match state.queue.push(deadline) {
                        Ok((id, rx)) => AcquireStep::Wait {
                            id,
                            rx,
                            queue_size: state.queue.len(),
                        },
                        Err(QueueFull) => AcquireStep::Backoff,
                    }
                }
            };

            match step {
                AcquireStep::Grow => {
                    let reservation = CreationSlot {
                        inner: Arc::clone(self),
                    };
                    debug!("No free session, opening a new one");
                    let session = self.open_session().await?;
                    let lease = self.register(session, true)?;
                    drop(reservation);
                    if let Some(lease) = lease {
                        return Ok(lease);
                    }
                }
                AcquireStep::Wait {
                    id,
                    mut rx,
                    queue_size,
                } => {
                    self.metrics.demand_queued();
                    self.emit(PoolEvent::DemandQueued { queue_size });
                    debug!(queue_size, "Pool at capacity, demand queued");

                    let remaining = deadline.saturating_duration_since(Instant::now());
                    return match tokio::time::timeout(remaining, &mut rx).await {
                        Ok(Ok(outcome)) => outcome,
                        Ok(Err(_)) => Err(PoolError::Shutdown),
                        Err(_) => {
                            let removed = self.lock_state().queue.remove(id).is_some();
                            if removed {
                                self.metrics.demand_timed_out();
                                warn!(waited_ms = started.elapsed().as_millis(), "Queued demand timed out");
                                Err(PoolError::Timeout(started.elapsed()))
                            } else {
                                // Fulfilled while the timer fired
                                rx.try_recv()
                                    .unwrap_or(Err(PoolError::Timeout(started.elapsed())))
                            }
                        }
                    };
                }
                AcquireStep::Backoff => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(PoolError::Timeout(started.elapsed()));
                    }
                    tokio::time::sleep(self.config.queue_backoff.min(deadline - now)).await;
                }
            }

            if Instant::now() >= deadline {
                return Err(PoolError::Timeout(started.elapsed()));
            }
        }
    }

    fn statistics(&self) -> PoolStatistics {
        use std::sync::atomic::Ordering::Relaxed;

        let (status, total, available, healthy, creating, queue_size) = {
            let state = self.lock_state();
            (
                state.status,
                state.slots.len(),
                state.slots.iter().filter(|s| s.available).count(),
                state
                    .slots
                    .iter()
                    .filter(|s| s.health.is_healthy())
                    .count(),
                state.creating,
                state.queue.len(),
            )
        };

        let m = &self.metrics;
        PoolStatistics {
            status,
            total_sessions: total,
            available_sessions: available,
            busy_sessions: total - available,
            healthy_sessions: healthy,
            pending_creations: creating,
            queue_size,
            total_requests: m.total_requests.load(Relaxed),
            failed_requests: m.failed_requests.load(Relaxed),
            error_rate: m.error_rate(),
            average_latency: m.average_latency(),
            sessions_created: m.sessions_created.load(Relaxed),
            sessions_evicted: m.sessions_evicted.load(Relaxed),
            sessions_rotated: m.sessions_rotated.load(Relaxed),
            sessions_idle_closed: m.sessions_idle_closed.load(Relaxed),
            demands_queued: m.demands_queued.load(Relaxed),
            demands_timed_out: m.demands_timed_out.load(Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

async fn consume_health_cycles(
    pool: Weak<PoolInner>,
    mut cycles: mpsc::UnboundedReceiver<Vec<HealthCheckResult>>,
) {
    while let Some(results) = cycles.recv().await {
        let Some(inner) = pool.upgrade() else {
            break;
        };
        inner.apply_health_cycle(&results);
    }
    debug!("Health cycle consumer ended");
}

// === Connection Pool ===

/// Main entry point: a shared handle to the pool. Cloning is cheap.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.inner.connector.endpoint())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Validate `config` and build an uninitialised pool.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> PoolResult<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let monitor = Arc::new(HealthMonitor::from_config(&config));
        let queue = DemandQueue::new(config.max_queue_size);

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                state: Mutex::new(PoolState {
                    status: PoolStatus::Initializing,
                    initializing: false,
                    slots: Vec::new(),
                    queue,
                    creating: 0,
                }),
                monitor,
                metrics: PoolMetrics::new(),
                events,
                started_at: Instant::now(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.lock_state().status
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.inner.monitor
    }

    /// Open `min_connections` sessions concurrently and start health checks.
    ///
    /// Any failed creation tears down the sessions that did open and fails the whole call.
    pub async fn initialize(&self) -> PoolResult<()> {
        {
            let mut state = self.inner.lock_state();
            match state.status {
                PoolStatus::Shutdown => return Err(PoolError::Shutdown),
                PoolStatus::Ready | PoolStatus::Degraded => {
                    return Err(PoolError::AlreadyInitialized);
                }
                PoolStatus::Initializing if state.initializing => {
                    return Err(PoolError::AlreadyInitialized);
                }
                PoolStatus::Initializing => state.initializing = true,
            }
        }

        let min = self.inner.config.min_connections;
        info!(
            endpoint = %self.inner.connector.endpoint(),
            min,
            max = self.inner.config.max_connections,
            "Initializing connection pool"
        );

        let results = join_all((0..min).map(|_| self.inner.open_session())).await;
        let mut opened = Vec::with_capacity(min);
        let mut failure = None;
        for result in results {
            match result {
                Ok(session) => opened.push(session),
                Err(e) => failure = failure.or(Some(e)),
            }
        }

        if let Some(e) = failure {
            error!(error = %e, opened = opened.len(), "Pool initialization failed, tearing down");
            Self::close_all(&opened).await;
            self.inner.lock_state().initializing = false;
            return Err(e);
        }

        {
            let mut state = self.inner.lock_state();
            state.initializing = false;
            if state.status == PoolStatus::Shutdown {
                drop(state);
                Self::close_all(&opened).await;
                return Err(PoolError::Shutdown);
            }
            state.slots.extend(
                opened
                    .iter()
                    .map(|session| SessionSlot::new(Arc::clone(session), true)),
            );
            state.status = PoolStatus::Ready;
        }

        for session in &opened {
            self.inner.metrics.session_created();
            self.inner.watch_connectivity(session);
            self.inner.emit(PoolEvent::SessionAdded {
                session_id: session.id(),
            });
        }

        let cycles = self.inner.monitor.start_monitoring(opened.clone());
        let consumer = tokio::spawn(consume_health_cycles(Arc::downgrade(&self.inner), cycles));
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(consumer);

        self.inner.emit(PoolEvent::Ready {
            sessions: opened.len(),
        });
        info!(sessions = opened.len(), "Connection pool ready");
        Ok(())
    }

    async fn close_all(sessions: &[SessionHandle]) {
        let closes = sessions.iter().map(|session| async move {
            if let Err(e) = session.correlator().close().await {
                warn!(session = %session.id(), error = %e, "Error closing session");
            }
        });
        join_all(closes).await;
    }

    /// Acquire a session within `acquire_timeout`.
    pub async fn acquire(&self) -> PoolResult<SessionLease> {
        self.inner.acquire_within(self.inner.config.acquire_timeout).await
    }

    pub async fn acquire_timeout(&self, timeout: Duration) -> PoolResult<SessionLease> {
        self.inner.acquire_within(timeout).await
    }

    /// Run one call on a pooled session.
    pub async fn execute(&self, method: &str, params: Option<Value>) -> PoolResult<Value> {
        self.execute_with(method, params, ExecuteOptions::default())
            .await
    }

    /// Run one call with per-request overrides.
    ///
    /// The lease is released whatever the outcome; dropping this future releases it too.
    pub async fn execute_with(
        &self,
        method: &str,
        params: Option<Value>,
        options: ExecuteOptions,
    ) -> PoolResult<Value> {
        let lease = self.acquire().await?;
        let call = &self.inner.config.call;
        let timeout = options.timeout.unwrap_or(call.timeout);
        let attempts = options.max_attempts.unwrap_or(call.max_attempts);

        let started = Instant::now();
        let outcome = lease
            .session()
            .correlator()
            .call_with_attempts(method, params, timeout, attempts)
            .await;
        let session_id = lease.id();
        lease.release();

        let elapsed = started.elapsed();
        match outcome {
            Ok(value) => {
                self.inner.metrics.request_succeeded(elapsed);
                Ok(value)
            }
            Err(e) => {
                self.inner.metrics.request_failed(elapsed);
                debug!(session = %session_id, method, error = %e, "Call failed");
                Err(PoolError::Call(e))
            }
        }
    }

    /// Run every request concurrently. Results come back in input order.
    pub async fn execute_batch(&self, requests: Vec<BatchRequest>) -> Vec<PoolResult<Value>> {
        join_all(
            requests
                .into_iter()
                .map(|r| async move { self.execute_with(&r.method, r.params, r.options).await }),
        )
        .await
    }

    /// Send a notification over any healthy session.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> PoolResult<()> {
        let lease = self.acquire().await?;
        let outcome = lease
            .session()
            .correlator()
            .send_notification(method, params)
            .await;
        lease.release();
        outcome.map_err(PoolError::Call)
    }

    pub fn get_statistics(&self) -> PoolStatistics {
        self.inner.statistics()
    }

    /// Read-only snapshot of every open session.
    pub fn get_connections(&self) -> Vec<SessionInfo> {
        self.inner
            .lock_state()
            .slots
            .iter()
            .map(SessionSlot::info)
            .collect()
    }

    pub fn get_queue_size(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<HealthAlert> {
        self.inner.monitor.subscribe_alerts()
    }

    /// Stop health checks, fail every waiter and close every session.
    ///
    /// Calls already running fail through transport loss. Idempotent.
    pub async fn shutdown(&self) -> PoolResult<()> {
        let (queued, slots) = {
            let mut state = self.inner.lock_state();
            if state.status == PoolStatus::Shutdown {
                return Ok(());
            }
            state.status = PoolStatus::Shutdown;
            (state.queue.drain_all(), std::mem::take(&mut state.slots))
        };

        info!(
            queued = queued.len(),
            sessions = slots.len(),
            "Shutting down connection pool"
        );

        for entry in queued {
            entry.abort(PoolError::Shutdown);
        }

        self.inner.monitor.stop_monitoring().await;
        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }

        let sessions: Vec<SessionHandle> = slots.into_iter().map(|slot| slot.session).collect();
        Self::close_all(&sessions).await;
        for session in &sessions {
            self.inner.monitor.remove_connection(session.id());
            self.inner.emit(PoolEvent::SessionRemoved {
                session_id: session.id(),
                reason: RemovalReason::Shutdown,
            });
        }

        self.inner.emit(PoolEvent::Shutdown);
        info!("Connection pool shut down");
        Ok(())
    }
}
