//! Message bus seam with at-least-once delivery.
//!
//! Subjects carry JSON payloads between pipeline stages. Consumers in the
//! same group compete for messages; an explicit `ack` is the sole commit
//! point. A `Delivery` dropped without ack goes back on the queue, which is
//! what makes crash-mid-processing safe: the worker never acks before its
//! downstream effect is durable.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::BusError;

/// Raw messages from ingesters.
pub const SUBJECT_RAW: &str = "sms.raw";
/// Normalized transactions bound for the writer.
pub const SUBJECT_PARSED: &str = "sms.parsed";
/// Dead-letter copies for external observability.
pub const SUBJECT_FAILED: &str = "sms.failed";
/// Heartbeat-style progress notes emitted by the worker.
pub const SUBJECT_PROCESSING: &str = "sms.processing";

/// A publish/subscribe bus with consumer groups and explicit acks.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError>;

    /// Join `group` on `subject`. Messages are load-balanced across members
    /// of the same group.
    async fn subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, BusError>;

    /// Messages queued for `group` on `subject` but not yet delivered.
    async fn pending(&self, subject: &str, group: &str) -> Result<u64, BusError>;
}

/// A consumer-group membership handing out deliveries one at a time.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message. Returns `None` once the bus shuts down.
    async fn next(&mut self) -> Option<Delivery>;
}

/// One message leased to a consumer.
///
/// Dropping a delivery without calling [`Delivery::ack`] puts the payload
/// back at the front of its group queue.
pub struct Delivery {
    payload: Vec<u8>,
    subject: String,
    queue: Arc<GroupQueue>,
    acked: bool,
}

impl Delivery {
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Commit: the message will not be redelivered.
    pub fn ack(mut self) {
        self.acked = true;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.acked {
            debug!(subject = %self.subject, "Unacked delivery requeued");
            self.queue.push_front(std::mem::take(&mut self.payload));
        }
    }
}

// ── In-memory implementation ────────────────────────────────────────

struct GroupQueue {
    messages: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl GroupQueue {
    fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push_back(&self, payload: Vec<u8>) {
        self.messages.lock().expect("queue lock").push_back(payload);
        self.notify.notify_one();
    }

    fn push_front(&self, payload: Vec<u8>) {
        self.messages.lock().expect("queue lock").push_front(payload);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.messages.lock().expect("queue lock").pop_front()
    }

    fn len(&self) -> usize {
        self.messages.lock().expect("queue lock").len()
    }
}

/// In-process bus for tests and single-node deployments.
///
/// Messages published to a subject fan out to every consumer group that has
/// subscribed; within a group they are competing-consumer. Publishes to a
/// subject nobody has joined yet are dropped, so consumers subscribe first.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    // subject → group → queue
    queues: Arc<Mutex<HashMap<String, HashMap<String, Arc<GroupQueue>>>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError> {
        let queues = self.queues.lock().expect("bus lock");
        if let Some(groups) = queues.get(subject) {
            for queue in groups.values() {
                queue.push_back(payload.to_vec());
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let queue = {
            let mut queues = self.queues.lock().expect("bus lock");
            queues
                .entry(subject.to_string())
                .or_default()
                .entry(group.to_string())
                .or_insert_with(|| Arc::new(GroupQueue::new()))
                .clone()
        };
        Ok(Box::new(InMemorySubscription {
            subject: subject.to_string(),
            queue,
        }))
    }

    async fn pending(&self, subject: &str, group: &str) -> Result<u64, BusError> {
        let queues = self.queues.lock().expect("bus lock");
        let depth = queues
            .get(subject)
            .and_then(|groups| groups.get(group))
            .map(|q| q.len())
            .unwrap_or(0);
        Ok(depth as u64)
    }
}

struct InMemorySubscription {
    subject: String,
    queue: Arc<GroupQueue>,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if let Some(payload) = self.queue.pop() {
                return Some(Delivery {
                    payload,
                    subject: self.subject.clone(),
                    queue: self.queue.clone(),
                    acked: false,
                });
            }
            self.queue.notify.notified().await;
        }
    }
}
