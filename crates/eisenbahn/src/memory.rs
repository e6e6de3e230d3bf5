//! In-process queues with delayed delivery and redelivery on nack.
//!
//! [`LocalQueue`] is the delivery buffer shared by every transport: the
//! [`MemoryBroker`] keeps one per routing key, and the ZeroMQ consumer feeds
//! one from its PULL socket.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::consumer::QueueMessage;
use crate::error::EisenbahnError;
use crate::traits::{QueueConsumer, QueueSender};

#[derive(Debug, Clone)]
struct Pending {
    id: String,
    body: Vec<u8>,
    delivery_count: u32,
}

#[derive(Debug)]
struct Delayed {
    due: Instant,
    seq: u64,
    pending: Pending,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Reversed so the BinaryHeap pops the earliest due message first.
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    delayed: BinaryHeap<Delayed>,
    in_flight: HashMap<String, Pending>,
    closed: bool,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.due <= now) {
            if let Some(d) = self.delayed.pop() {
                self.ready.push_back(d.pending);
            }
        }
    }
}

/// A single at-least-once queue.
#[derive(Debug)]
pub struct LocalQueue {
    routing_key: String,
    state: Mutex<QueueState>,
    notify: Notify,
    seq: AtomicU64,
}

impl LocalQueue {
    pub fn new(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock cannot leave the queue half-updated:
        // every critical section is a single push/pop/insert.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue a message, optionally hidden until `delay` has elapsed.
    pub fn push(&self, body: Vec<u8>, delay: Option<Duration>) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let pending = Pending {
            id: format!("{}-{seq}", self.routing_key),
            body,
            delivery_count: 0,
        };
        {
            let mut state = self.state();
            match delay.filter(|d| !d.is_zero()) {
                Some(delay) => state.delayed.push(Delayed {
                    due: Instant::now() + delay,
                    seq,
                    pending,
                }),
                None => state.ready.push_back(pending),
            }
        }
        self.notify.notify_one();
    }

    /// Take the next deliverable message without waiting.
    pub fn try_recv(&self) -> Option<QueueMessage> {
        let mut state = self.state();
        state.promote_due(Instant::now());
        let mut pending = state.ready.pop_front()?;
        pending.delivery_count += 1;
        let receipt_handle = format!("{}#{}", pending.id, pending.delivery_count);
        let message = QueueMessage {
            id: pending.id.clone(),
            routing_key: self.routing_key.clone(),
            body: pending.body.clone(),
            receipt_handle: receipt_handle.clone(),
            delivery_count: pending.delivery_count,
        };
        state.in_flight.insert(receipt_handle, pending);
        Some(message)
    }

    /// Stop delivering. Waiting and future `recv` calls return `None`.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    /// Messages waiting for delivery, delayed ones included.
    pub fn pending_len(&self) -> usize {
        let state = self.state();
        state.ready.len() + state.delayed.len()
    }

    /// Messages still hidden behind a delivery delay.
    pub fn delayed_len(&self) -> usize {
        self.state().delayed.len()
    }

    /// Messages delivered but not yet acked or nacked.
    pub fn in_flight_len(&self) -> usize {
        self.state().in_flight.len()
    }

    fn next_due(&self) -> Result<Option<Instant>, ()> {
        let state = self.state();
        if state.closed {
            return Err(());
        }
        Ok(state.delayed.peek().map(|d| d.due))
    }
}

#[async_trait]
impl QueueConsumer for LocalQueue {
    fn routing_key(&self) -> &str {
        &self.routing_key
    }

    async fn recv(&self) -> Result<Option<QueueMessage>, EisenbahnError> {
        loop {
            // Register interest before inspecting state so a push or close
            // between the check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = match self.next_due() {
                Ok(next_due) => next_due,
                Err(()) => return Ok(None),
            };
            if let Some(message) = self.try_recv() {
                return Ok(Some(message));
            }

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(due) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), EisenbahnError> {
        self.state()
            .in_flight
            .remove(receipt_handle)
            .map(|_| ())
            .ok_or_else(|| EisenbahnError::UnknownReceipt(receipt_handle.to_string()))
    }

    async fn nack(&self, receipt_handle: &str) -> Result<(), EisenbahnError> {
        {
            let mut state = self.state();
            let pending = state
                .in_flight
                .remove(receipt_handle)
                .ok_or_else(|| EisenbahnError::UnknownReceipt(receipt_handle.to_string()))?;
            debug!(routing_key = %self.routing_key, id = %pending.id, "message nacked, requeued");
            state.ready.push_front(pending);
        }
        self.notify.notify_one();
        Ok(())
    }
}

/// In-process broker: one [`LocalQueue`] per routing key, created on first use.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, Arc<LocalQueue>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The queue for `routing_key`. Consumers of the same key share it and
    /// compete for messages.
    pub fn queue(&self, routing_key: &str) -> Arc<LocalQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queues
            .entry(routing_key.to_string())
            .or_insert_with(|| Arc::new(LocalQueue::new(routing_key)))
            .clone()
    }

    /// Close every queue, releasing all waiting consumers.
    pub fn close_all(&self) {
        let queues = self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for queue in queues.values() {
            queue.close();
        }
    }
}

#[async_trait]
impl QueueSender for MemoryBroker {
    async fn send(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        delay: Option<Duration>,
    ) -> Result<(), EisenbahnError> {
        self.queue(routing_key).push(body, delay);
        debug!(routing_key, ?delay, "queued message");
        Ok(())
    }
}
