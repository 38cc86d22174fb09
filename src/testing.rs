// ABOUTME: Scripted in-memory daemon used by unit tests
// ABOUTME: Implements Connector with per-method latency, errors, hangs, crashes and link drops

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::protocol::{ErrorObject, IncomingMessage, Notification, OutgoingMessage, Response};
use crate::transport::{Connector, MessageSink, TransportError, TransportEvent, TransportLink};

#[derive(Default)]
struct Script {
    latency: HashMap<String, Duration>,
    errors: HashMap<String, (i32, String)>,
    hangs: HashSet<String>,
    crashes: HashSet<String>,
    /// Remaining successful connects; `None` means unlimited
    connect_budget: Option<usize>,
}

struct LinkHandle {
    events: mpsc::Sender<TransportEvent>,
    open: Arc<AtomicBool>,
}

/// Fake daemon shared by every link it hands out.
#[derive(Default)]
pub struct MockDaemon {
    script: Mutex<Script>,
    links: Mutex<Vec<LinkHandle>>,
    requests: Mutex<HashMap<String, usize>>,
    notifications: Mutex<Vec<Notification>>,
    connects: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> MockConnector {
        MockConnector {
            daemon: Arc::clone(self),
        }
    }

    pub fn set_latency(&self, method: &str, latency: Duration) {
        lock(&self.script).latency.insert(method.to_string(), latency);
    }

    pub fn set_error(&self, method: &str, code: i32, message: &str) {
        lock(&self.script)
            .errors
            .insert(method.to_string(), (code, message.to_string()));
    }

    /// Never answer `method`.
    pub fn hang(&self, method: &str) {
        lock(&self.script).hangs.insert(method.to_string());
    }

    /// Drop the link that receives `method`.
    pub fn crash_on(&self, method: &str) {
        lock(&self.script).crashes.insert(method.to_string());
    }

    /// Allow `successes` more connects, then refuse.
    pub fn fail_connects_after(&self, successes: usize) {
        lock(&self.script).connect_budget = Some(successes);
    }

    pub fn allow_connects(&self) {
        lock(&self.script).connect_budget = None;
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn open_links(&self) -> usize {
        lock(&self.links)
            .iter()
            .filter(|l| l.open.load(Ordering::SeqCst))
            .count()
    }

    pub fn requests(&self, method: &str) -> usize {
        lock(&self.requests).get(method).copied().unwrap_or(0)
    }

    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.notifications).clone()
    }

    /// Highest number of requests ever outstanding on a single link.
    pub fn peak_in_flight_per_link(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Inject an inbound message on link `index` (in connect order).
    pub async fn push(&self, index: usize, message: IncomingMessage) {
        let tx = lock(&self.links).get(index).map(|l| l.events.clone());
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Message(message)).await;
        }
    }

    /// Kill link `index` as if the daemon closed the socket.
    pub async fn drop_link(&self, index: usize) {
        let link = lock(&self.links)
            .get(index)
            .map(|l| (l.events.clone(), Arc::clone(&l.open)));
        if let Some((tx, open)) = link {
            if open.swap(false, Ordering::SeqCst) {
                let _ = tx.send(TransportEvent::Lost("dropped by mock".to_string())).await;
            }
        }
    }

    pub async fn drop_all_links(&self) {
        let count = lock(&self.links).len();
        for index in 0..count {
            self.drop_link(index).await;
        }
    }

    fn respond(&self, method: &str, params: Option<Value>) -> Option<(Duration, ResponseBody)> {
        let script = lock(&self.script);
        if script.hangs.contains(method) {
            return None;
        }
        let latency = script.latency.get(method).copied().unwrap_or_default();
        let body = match script.errors.get(method) {
            Some((code, message)) => ResponseBody::Error(ErrorObject::new(*code, message.clone())),
            None if method == "ping" => ResponseBody::Result(json!("pong")),
            None => ResponseBody::Result(json!({
                "method": method,
                "params": params.unwrap_or(Value::Null),
            })),
        };
        Some((latency, body))
    }
}

enum ResponseBody {
    Result(Value),
    Error(ErrorObject),
}

/// Connector backed by a [`MockDaemon`].
#[derive(Clone)]
pub struct MockConnector {
    daemon: Arc<MockDaemon>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<TransportLink, TransportError> {
        {
            let mut script = lock(&self.daemon.script);
            if let Some(budget) = script.connect_budget.as_mut() {
                if *budget == 0 {
                    return Err(TransportError::ConnectFailed {
                        endpoint: self.endpoint(),
                        reason: "connection refused".to_string(),
                    });
                }
                *budget -= 1;
            }
        }

        self.daemon.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, events) = mpsc::channel(64);
        let open = Arc::new(AtomicBool::new(true));
        let index = {
            let mut links = lock(&self.daemon.links);
            links.push(LinkHandle {
                events: tx.clone(),
                open: Arc::clone(&open),
            });
            links.len() - 1
        };

        Ok(TransportLink {
            sink: Arc::new(MockSink {
                daemon: Arc::clone(&self.daemon),
                index,
                events: tx,
                open,
                in_flight: Arc::new(AtomicUsize::new(0)),
            }),
            events,
        })
    }

    fn endpoint(&self) -> String {
        "mock://daemon".to_string()
    }
}

struct MockSink {
    daemon: Arc<MockDaemon>,
    index: usize,
    events: mpsc::Sender<TransportEvent>,
    open: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageSink for MockSink {
    async fn send(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let request = match message {
            OutgoingMessage::Notification(n) => {
                lock(&self.daemon.notifications).push(n);
                return Ok(());
            }
            OutgoingMessage::Request(r) => r,
        };

        *lock(&self.daemon.requests)
            .entry(request.method.clone())
            .or_insert(0) += 1;

        let crashes = lock(&self.daemon.script).crashes.contains(&request.method);
        if crashes {
            self.daemon.drop_link(self.index).await;
            return Ok(());
        }

        let Some((latency, body)) = self.daemon.respond(&request.method, request.params.clone())
        else {
            return Ok(());
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.daemon.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let events = self.events.clone();
        let open = Arc::clone(&self.open);
        let in_flight = Arc::clone(&self.in_flight);
        let id = request.id;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            if !open.load(Ordering::SeqCst) {
                return;
            }
            let response = match body {
                ResponseBody::Result(value) => Response::success(id, value),
                ResponseBody::Error(error) => Response::error(Some(id), error),
            };
            let _ = events
                .send(TransportEvent::Message(IncomingMessage::Response(response)))
                .await;
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}
