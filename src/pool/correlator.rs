// ABOUTME: JSON-RPC request/response correlation over one daemon connection
// ABOUTME: Owns the id counter and pending-call registry, fails everything fast on transport loss

//! RPC correlation for a single session.
//!
//! Every outgoing request gets a fresh numeric id and a pending entry holding a oneshot
//! sender. A reader task consumes the link's [`TransportEvent`]s and resolves entries as
//! responses arrive.
//!
//! # Flow
//!
//! 1. `call()` allocates id `N`, registers `N -> PendingCall` then writes the request
//! 2. Reader receives `{"id": N, ...}`, removes `N` and completes the oneshot
//! 3. A caller that stops waiting (timeout) removes its own entry; a late response for
//!    `N` then finds nothing and is dropped
//! 4. On transport loss every remaining entry fails with [`CallError::ConnectionLost`]
//!
//! Each entry is removed exactly once, by whichever of the three parties gets there first,
//! so every call completes exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::config::CallConfig;
use crate::protocol::{IncomingMessage, Notification, OutgoingMessage, Request, Response};
use crate::transport::{Connector, MessageSink, TransportError, TransportEvent, TransportLink};

/// Largest id handed out before the counter wraps back to 1.
///
/// Kept inside the range every JSON implementation represents exactly.
pub const MAX_CORRELATION_ID: u64 = (1 << 53) - 1;

/// Why a call did not produce a result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// No response within the per-attempt deadline (after all attempts)
    #[error("Call '{method}' timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    /// The link died while the call was outstanding
    #[error("Connection lost")]
    ConnectionLost,

    /// The session has no live link
    #[error("Not connected")]
    NotConnected,

    /// The daemon answered with a JSON-RPC error
    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    /// Writing the request failed
    #[error("Transport error: {0}")]
    Transport(String),
}

impl CallError {
    /// Only timeouts are worth another attempt on the same session.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

type CallOutcome = Result<Value, CallError>;

/// A call waiting for its response.
struct PendingCall {
    method: String,
    sent_at: Instant,
    tx: oneshot::Sender<CallOutcome>,
}

/// State shared between the correlator and its reader task.
struct Shared {
    pending: Mutex<HashMap<u64, PendingCall>>,
    connected: watch::Sender<bool>,
    generation: AtomicU64,
    notifications: Mutex<Option<mpsc::UnboundedSender<Notification>>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, response: Response) {
        let Some(id) = response.id.as_ref().and_then(crate::protocol::RequestId::as_number) else {
            warn!(id = ?response.id, "Response without a usable id, discarding");
            return;
        };

        let Some(call) = self.pending().remove(&id) else {
            debug!(id, "Unmatched response, discarding");
            return;
        };

        let outcome = response.into_outcome().map_err(|e| CallError::Rpc {
            code: e.code,
            message: e.message,
            data: e.data,
        });

        trace!(
            id,
            method = %call.method,
            elapsed_ms = call.sent_at.elapsed().as_millis(),
            "Response matched"
        );

        // Receiver gone means the caller gave up at the same instant; nothing to do
        let _ = call.tx.send(outcome);
    }

    fn forward(&self, notification: Notification) {
        let mut guard = self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match guard.as_ref() {
            Some(tx) => {
                if tx.send(notification).is_err() {
                    *guard = None;
                }
            }
            None => {
                trace!(method = %notification.method, "Notification without subscriber");
            }
        }
    }

    /// Flip to disconnected and fail whatever is still outstanding.
    ///
    /// The flag flips before the drain so a caller registering concurrently either sees
    /// the flag or gets drained.
    fn fail_pending(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.connected.send_replace(false);

        let drained: Vec<PendingCall> = self.pending().drain().map(|(_, call)| call).collect();
        if !drained.is_empty() {
            warn!(count = drained.len(), reason, "Failing pending calls after transport loss");
        }
        for call in drained {
            let _ = call.tx.send(Err(CallError::ConnectionLost));
        }
    }
}

/// Currently attached link.
struct ActiveLink {
    sink: Arc<dyn MessageSink>,
    reader: JoinHandle<()>,
}

/// Correlates requests and responses on one connection.
pub struct RpcCorrelator {
    connector: Arc<dyn Connector>,
    config: CallConfig,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    link: Mutex<Option<ActiveLink>>,
}

impl std::fmt::Debug for RpcCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCorrelator")
            .field("endpoint", &self.connector.endpoint())
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl RpcCorrelator {
    /// Open a link through `connector` and start correlating on it.
    pub async fn connect(
        connector: Arc<dyn Connector>,
        config: CallConfig,
    ) -> Result<Self, TransportError> {
        let link = connector.connect().await?;
        let (connected, _) = watch::channel(false);

        let correlator = Self {
            connector,
            config,
            next_id: AtomicU64::new(1),
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                connected,
                generation: AtomicU64::new(0),
                notifications: Mutex::new(None),
            }),
            link: Mutex::new(None),
        };
        correlator.attach(link);
        Ok(correlator)
    }

    fn attach(&self, link: TransportLink) {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let reader = tokio::spawn(read_loop(Arc::clone(&self.shared), link.events, generation));

        let previous = self.link_guard().replace(ActiveLink {
            sink: link.sink,
            reader,
        });
        if let Some(old) = previous {
            old.reader.abort();
        }
        self.shared.connected.send_replace(true);
    }

    fn link_guard(&self) -> MutexGuard<'_, Option<ActiveLink>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_sink(&self) -> Option<Arc<dyn MessageSink>> {
        self.link_guard().as_ref().map(|l| Arc::clone(&l.sink))
    }

    /// Next id in `1..=MAX_CORRELATION_ID`, skipping any still in flight.
    fn allocate_id(&self) -> u64 {
        loop {
            let id = match self.next_id.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                Some(if cur >= MAX_CORRELATION_ID { 1 } else { cur + 1 })
            }) {
                Ok(prev) | Err(prev) => prev,
            };
            if !self.shared.pending().contains_key(&id) {
                return id;
            }
        }
    }

    /// Call `method` with the configured retry policy.
    ///
    /// `timeout` overrides the per-attempt deadline from [`CallConfig`].
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, CallError> {
        self.call_with_attempts(
            method,
            params,
            timeout.unwrap_or(self.config.timeout),
            self.config.max_attempts,
        )
        .await
    }

    /// Call with an explicit deadline per attempt and attempt count.
    ///
    /// Only [`CallError::Timeout`] triggers another attempt.
    pub async fn call_with_attempts(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Result<Value, CallError> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.call_once(method, params.clone(), timeout).await {
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(method, attempt, max_attempts, "Call timed out, retrying");
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn call_once(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let sink = self.current_sink().ok_or(CallError::NotConnected)?;
        if !self.is_connected() {
            return Err(CallError::NotConnected);
        }

        let id = self.allocate_id();
        let (tx, mut rx) = oneshot::channel();
        self.shared.pending().insert(
            id,
            PendingCall {
                method: method.to_string(),
                sent_at: Instant::now(),
                tx,
            },
        );

        // Lost between the check above and the insert: drain may have missed us
        if !self.is_connected() && self.shared.pending().remove(&id).is_some() {
            return Err(CallError::ConnectionLost);
        }

        let request = OutgoingMessage::Request(Request::new(id, method, params));
        if let Err(e) = sink.send(request).await {
            self.shared.pending().remove(&id);
            return Err(CallError::Transport(e.to_string()));
        }
        trace!(id, method, "Request sent");

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallError::ConnectionLost),
            Err(_) => {
                if self.shared.pending().remove(&id).is_some() {
                    debug!(id, method, timeout_ms = timeout.as_millis(), "Call timed out");
                    Err(CallError::Timeout {
                        method: method.to_string(),
                        after: timeout,
                    })
                } else {
                    // Resolved while the timer fired
                    rx.try_recv().unwrap_or(Err(CallError::ConnectionLost))
                }
            }
        }
    }

    /// Send a notification. No id, no response.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), CallError> {
        let sink = self.current_sink().ok_or(CallError::NotConnected)?;
        if !self.is_connected() {
            return Err(CallError::NotConnected);
        }
        sink.send(OutgoingMessage::Notification(Notification::new(method, params)))
            .await
            .map_err(|e| CallError::Transport(e.to_string()))
    }

    /// Receive notifications pushed by the daemon. Replaces any earlier subscriber.
    pub fn subscribe_notifications(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .shared
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Watch connectivity. Flips to `false` once per lost link.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }

    /// Drop the current link and open a fresh one through the same connector.
    ///
    /// Calls outstanding on the old link fail with [`CallError::ConnectionLost`].
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        if let Err(e) = self.detach("reconnecting").await {
            debug!(error = %e, "Closing previous link failed");
        }
        let link = self.connector.connect().await?;
        self.attach(link);
        debug!(endpoint = %self.connector.endpoint(), "Correlator reconnected");
        Ok(())
    }

    /// Close the link and fail outstanding calls. Idempotent.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.detach("closed").await
    }

    async fn detach(&self, reason: &str) -> Result<(), TransportError> {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        let link = self.link_guard().take();
        self.shared.fail_pending(generation, reason);

        match link {
            Some(link) => {
                link.reader.abort();
                link.sink.close().await
            }
            None => Ok(()),
        }
    }
}

impl Drop for RpcCorrelator {
    fn drop(&mut self) {
        if let Some(link) = self
            .link
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            link.reader.abort();
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut events: mpsc::Receiver<TransportEvent>, generation: u64) {
    let reason = loop {
        match events.recv().await {
            Some(TransportEvent::Message(IncomingMessage::Response(response))) => {
                shared.resolve(response);
            }
            Some(TransportEvent::Message(IncomingMessage::Notification(notification))) => {
                shared.forward(notification);
            }
            Some(TransportEvent::Lost(reason)) => break reason,
            None => break "transport event stream ended".to_string(),
        }
    };

    shared.fail_pending(generation, &reason);
}
