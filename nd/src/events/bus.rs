//! Event Bus - central pub/sub for newscrawld activity
//!
//! The bus fans typed events out to subscribers over tokio broadcast
//! channels. Publishing never blocks: a slow subscriber overflows its own
//! buffer and receives a lag marker instead of stalling the publisher.
//! A bounded retention ring keeps recent envelopes for reconnect resumption.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use newsstore::{Observation, PlannerStageEvent, QueueEvent, TaskRow, TaskStatus, now_ms};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{BusEvent, Delivery, Envelope, Topic};

/// Per-subscriber buffer bound (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Envelopes kept for reconnect resumption
pub const DEFAULT_RETENTION: usize = 1024;

/// Idle keep-alive interval
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Central event bus
///
/// Components publish; consumers (SSE clients, CLI tailers) subscribe with a
/// topic filter. Every envelope carries a monotonically increasing sequence
/// number so subscribers can detect gaps after an overflow.
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
    seq: AtomicU64,
    retention: Mutex<VecDeque<Envelope>>,
    retention_cap: usize,
    heartbeat: Duration,
}

impl EventBus {
    pub fn new(capacity: usize, retention_cap: usize, heartbeat: Duration) -> Self {
        debug!(capacity, retention_cap, "EventBus::new");
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: AtomicU64::new(0),
            retention: Mutex::new(VecDeque::with_capacity(retention_cap.min(64))),
            retention_cap,
            heartbeat,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY, DEFAULT_RETENTION, DEFAULT_HEARTBEAT)
    }

    /// Publish an event to all subscribers
    ///
    /// Fire-and-forget: no subscribers is fine. Returns the assigned
    /// sequence number.
    pub fn emit(&self, event: BusEvent) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = Envelope {
            seq,
            ts: now_ms(),
            event,
        };
        debug!(seq, topic = %envelope.event.topic(), "EventBus::emit");

        {
            let mut retention = self.retention.lock().unwrap_or_else(|e| e.into_inner());
            if retention.len() == self.retention_cap {
                retention.pop_front();
            }
            retention.push_back(envelope.clone());
        }

        let _ = self.tx.send(envelope);
        seq
    }

    /// Subscribe to a set of topics
    ///
    /// The subscription is a capability: dropping it cancels delivery and
    /// releases the buffer.
    pub fn subscribe(&self, topics: &[Topic]) -> Subscription {
        debug!(?topics, "EventBus::subscribe");
        Subscription {
            rx: self.tx.subscribe(),
            topics: topics.iter().copied().collect(),
            heartbeat: self.heartbeat,
        }
    }

    /// Subscribe to every topic
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(&Topic::ALL)
    }

    /// Subscribe and capture current state in one step
    ///
    /// The snapshot function is caller-supplied so the bus never owns state;
    /// subscription happens first, so an event published while the snapshot
    /// is being produced is not lost, merely delivered after it.
    pub fn subscribe_with_snapshot<S, F>(&self, topics: &[Topic], snapshot_fn: F) -> (S, Subscription)
    where
        F: FnOnce() -> S,
    {
        let subscription = self.subscribe(topics);
        (snapshot_fn(), subscription)
    }

    /// Envelopes retained with a sequence number greater than `last_seq`
    ///
    /// Used by reconnecting SSE clients supplying `Last-Event-ID`.
    pub fn replay_since(&self, last_seq: u64) -> Vec<Envelope> {
        let retention = self.retention.lock().unwrap_or_else(|e| e.into_inner());
        retention.iter().filter(|e| e.seq > last_seq).cloned().collect()
    }

    /// Number of attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Latest assigned sequence number
    pub fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    // === Convenience emitters ===

    pub fn task_created(&self, task: &TaskRow) {
        self.emit(BusEvent::TaskCreated { task: task.clone() });
    }

    pub fn task_status_changed(&self, task_id: &str, status: TaskStatus, error_message: Option<String>) {
        self.emit(BusEvent::TaskStatusChanged {
            task_id: task_id.to_string(),
            status,
            error_message,
        });
    }

    pub fn task_progress(
        &self,
        task_id: &str,
        current: u64,
        total: u64,
        message: Option<String>,
        stage: Option<String>,
    ) {
        self.emit(BusEvent::TaskProgress {
            task_id: task_id.to_string(),
            current,
            total,
            message,
            stage,
        });
    }

    pub fn task_completed(&self, task_id: &str, status: TaskStatus, summary: Value) {
        self.emit(BusEvent::TaskCompleted {
            task_id: task_id.to_string(),
            success: status == TaskStatus::Completed,
            status,
            summary,
        });
    }

    pub fn task_error(&self, task_id: &str, message: &str, fatal: bool) {
        self.emit(BusEvent::TaskError {
            task_id: task_id.to_string(),
            message: message.to_string(),
            fatal,
        });
    }

    pub fn task_problem(&self, problem: Observation) {
        self.emit(BusEvent::TaskProblem { problem });
    }

    pub fn milestone(&self, milestone: Observation) {
        self.emit(BusEvent::Milestone { milestone });
    }

    pub fn queue_event(&self, event: QueueEvent) {
        self.emit(BusEvent::QueueEvent { event });
    }

    pub fn planner_stage(&self, stage: PlannerStageEvent) {
        self.emit(BusEvent::PlannerStage { stage });
    }

    pub fn job_list_changed(&self, active: Vec<String>) {
        self.emit(BusEvent::JobListChanged { active });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Create an event bus wrapped in an Arc for shared ownership
pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_defaults())
}

/// A topic-filtered, cancellable event stream
///
/// Dropping the subscription revokes it.
pub struct Subscription {
    rx: broadcast::Receiver<Envelope>,
    topics: HashSet<Topic>,
    heartbeat: Duration,
}

impl Subscription {
    /// Receive the next delivery
    ///
    /// Returns `None` once the bus is gone. Filtered-out topics are skipped
    /// transparently. If nothing matches within the heartbeat interval a
    /// `Heartbeat` is yielded so downstream connections stay alive.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match tokio::time::timeout(self.heartbeat, self.rx.recv()).await {
                Err(_elapsed) => return Some(Delivery::Heartbeat { ts: now_ms() }),
                Ok(Ok(envelope)) => {
                    if self.topics.contains(&envelope.event.topic()) {
                        return Some(Delivery::Event(envelope));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    return Some(Delivery::Lagged { missed });
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
            }
        }
    }

    /// Non-blocking receive, used by tests and the CLI tailer drain path
    pub fn try_recv(&mut self) -> Option<Delivery> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => {
                    if self.topics.contains(&envelope.event.topic()) {
                        return Some(Delivery::Event(envelope));
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    return Some(Delivery::Lagged { missed });
                }
                Err(_) => return None,
            }
        }
    }
}
