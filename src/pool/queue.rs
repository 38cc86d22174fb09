// ABOUTME: Bounded FIFO of callers waiting for a session
// ABOUTME: Each entry owns a oneshot sender that is resolved exactly once: fulfilled, aborted or removed

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::oneshot;
use uuid::Uuid;

/// A caller parked until a session frees up.
#[derive(Debug)]
pub struct QueuedDemand<T, E> {
    pub id: Uuid,
    pub enqueued_at: Instant,
    /// Past this instant the waiter is failed instead of served
    pub deadline: Instant,
    tx: oneshot::Sender<Result<T, E>>,
}

impl<T, E> QueuedDemand<T, E> {
    /// Hand `value` to the waiter. Gives it back if the waiter already left.
    pub fn fulfill(self, value: T) -> Result<(), T> {
        match self.tx.send(Ok(value)) {
            Err(Ok(value)) => Err(value),
            Ok(()) | Err(Err(_)) => Ok(()),
        }
    }

    /// Fail the waiter. A departed waiter is ignored.
    pub fn abort(self, error: E) {
        let _ = self.tx.send(Err(error));
    }

    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Returned by [`DemandQueue::push`] when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

/// FIFO with a fixed capacity.
#[derive(Debug)]
pub struct DemandQueue<T, E> {
    entries: VecDeque<QueuedDemand<T, E>>,
    capacity: usize,
}

impl<T, E> DemandQueue<T, E> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    /// Append a waiter and return its id plus the receiving end.
    pub fn push(
        &mut self,
        deadline: Instant,
    ) -> Result<(Uuid, oneshot::Receiver<Result<T, E>>), QueueFull> {
        if self.entries.len() >= self.capacity {
            return Err(QueueFull);
        }
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        self.entries.push_back(QueuedDemand {
            id,
            enqueued_at: Instant::now(),
            deadline,
            tx,
        });
        Ok((id, rx))
    }

    /// Oldest waiter that is still listening. Abandoned entries are discarded.
    pub fn pop_front(&mut self) -> Option<QueuedDemand<T, E>> {
        while let Some(entry) = self.entries.pop_front() {
            if !entry.is_abandoned() {
                return Some(entry);
            }
        }
        None
    }

    /// Take a specific waiter out, e.g. after it timed out.
    pub fn remove(&mut self, id: Uuid) -> Option<QueuedDemand<T, E>> {
        let index = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(index)
    }

    pub fn drain_all(&mut self) -> Vec<QueuedDemand<T, E>> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
