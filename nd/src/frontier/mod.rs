//! Frontier - per-crawl priority queue of URLs with host fairness
//!
//! A max-heap keyed on `(effective priority, -host recent fetches,
//! -insertion seq)` plus a url-keyed side map for idempotent insert. Stale
//! heap slots left behind by priority raises are skipped lazily on dequeue.
//!
//! The frontier is pure in-memory state owned by one crawl job; every
//! mutation produces a [`QueueEvent`] that the owner drains and persists.

mod scorer;

pub use scorer::PriorityScorer;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use newsstore::{QueueAction, QueueEvent, now_ms};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Frontier tuning knobs
#[derive(Debug, Clone)]
pub struct FrontierConfig {
    /// Sliding window for per-host fetch counting
    pub host_window_ms: i64,
    /// Priority milli-units depressed per recent fetch on the same host
    pub host_penalty_milli: i64,
    /// Apply cost-aware re-scoring on enqueue
    pub cost_aware: bool,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            host_window_ms: 60_000,
            host_penalty_milli: 1_000,
            cost_aware: false,
        }
    }
}

/// A pending URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontierEntry {
    pub url: String,
    pub host: String,
    pub depth: u32,
    /// Base priority; higher dequeues first
    pub priority: i64,
    /// Source tag, e.g. "adaptive-seed", "pattern", "discovered"
    pub source: String,
    pub estimated_cost_ms: Option<u64>,
}

impl FrontierEntry {
    pub fn new(url: impl Into<String>, host: impl Into<String>, depth: u32, priority: i64) -> Self {
        Self {
            url: url.into(),
            host: host.into(),
            depth,
            priority,
            source: "discovered".to_string(),
            estimated_cost_ms: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_cost(mut self, estimated_cost_ms: u64) -> Self {
        self.estimated_cost_ms = Some(estimated_cost_ms);
        self
    }

    fn depth_bucket(&self) -> &'static str {
        match self.depth {
            0..=1 => "shallow",
            2..=3 => "mid",
            _ => "deep",
        }
    }
}

struct EntryState {
    entry: FrontierEntry,
    version: u64,
}

struct HeapSlot {
    effective_milli: i64,
    host_recent: u64,
    seq: u64,
    version: u64,
    url: String,
}

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for HeapSlot {}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; fewer recent fetches on the host first;
        // earlier insertion first. Deterministic given state.
        self.effective_milli
            .cmp(&other.effective_milli)
            .then_with(|| other.host_recent.cmp(&self.host_recent))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of URLs to fetch for one crawl job
pub struct Frontier {
    task_id: String,
    config: FrontierConfig,
    heap: BinaryHeap<HeapSlot>,
    entries: HashMap<String, EntryState>,
    /// Dequeue timestamps per host, pruned to the sliding window
    host_fetches: HashMap<String, VecDeque<i64>>,
    scorer: PriorityScorer,
    insertion_seq: u64,
    pending_events: Vec<QueueEvent>,
}

impl Frontier {
    pub fn new(task_id: impl Into<String>, config: FrontierConfig) -> Self {
        Self {
            task_id: task_id.into(),
            config,
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            host_fetches: HashMap::new(),
            scorer: PriorityScorer::default(),
            insertion_seq: 0,
            pending_events: Vec::new(),
        }
    }

    /// Number of distinct pending URLs
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    /// Record an observed fetch duration for cost-aware scoring
    pub fn record_fetch_duration(&mut self, duration_ms: u64) {
        self.scorer.record(duration_ms);
    }

    /// Insert a URL, or raise its priority if already present
    ///
    /// Re-enqueue is priority-monotonic: the new base priority is the max of
    /// the old and proposed values.
    pub fn enqueue(&mut self, mut entry: FrontierEntry) {
        let now = now_ms();
        let host_recent = self.recent_host_fetches(&entry.host, now);

        if let Some(state) = self.entries.get_mut(&entry.url) {
            if entry.priority <= state.entry.priority {
                // Already queued at least this high; nothing to do
                debug!(url = %entry.url, "Frontier::enqueue: duplicate at lower priority");
                return;
            }
            state.entry.priority = entry.priority;
            if entry.estimated_cost_ms.is_some() {
                state.entry.estimated_cost_ms = entry.estimated_cost_ms;
            }
            state.version += 1;
            entry = state.entry.clone();
            let version = state.version;
            self.push_slot(&entry, host_recent, version);
            self.record_event(QueueAction::Enqueue, &entry.url, Some(&entry), Some("priority-raised"));
            return;
        }

        self.insertion_seq += 1;
        let version = 1;
        self.entries
            .insert(entry.url.clone(), EntryState { entry: entry.clone(), version });
        self.push_slot(&entry, host_recent, version);
        self.record_event(QueueAction::Enqueue, &entry.url, Some(&entry), None);
    }

    fn push_slot(&mut self, entry: &FrontierEntry, host_recent: u64, version: u64) {
        let base_milli = if self.config.cost_aware {
            self.scorer.score_milli(entry.priority, entry.estimated_cost_ms)
        } else {
            entry.priority * 1000
        };
        let effective_milli = base_milli - self.config.host_penalty_milli * host_recent as i64;
        self.heap.push(HeapSlot {
            effective_milli,
            host_recent,
            seq: self.insertion_seq,
            version,
            url: entry.url.clone(),
        });
    }

    /// Pop the highest-priority entry, respecting host fairness
    pub fn dequeue(&mut self) -> Option<FrontierEntry> {
        let now = now_ms();
        while let Some(slot) = self.heap.pop() {
            // Slots left behind by priority raises are stale; skip lazily
            let current = self.entries.get(&slot.url).map(|s| s.version);
            if current != Some(slot.version) {
                continue;
            }
            if let Some(state) = self.entries.remove(&slot.url) {
                self.note_host_fetch(&state.entry.host, now);
                self.record_event(QueueAction::Dequeue, &state.entry.url, Some(&state.entry), None);
                return Some(state.entry);
            }
        }
        None
    }

    /// Record a filtered-out URL without enqueueing it
    pub fn skip(&mut self, url: &str, reason: &str) {
        self.record_event(QueueAction::Skip, url, None, Some(reason));
    }

    /// Highest-priority pending entries, best first
    pub fn snapshot(&self, limit: usize) -> Vec<FrontierEntry> {
        let mut entries: Vec<&EntryState> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            b.entry
                .priority
                .cmp(&a.entry.priority)
                .then_with(|| a.entry.url.cmp(&b.entry.url))
        });
        entries.into_iter().take(limit).map(|s| s.entry.clone()).collect()
    }

    /// Drain queue events produced since the last call
    ///
    /// The owning runner persists these and publishes them on the bus; the
    /// frontier itself stays synchronous and storage-free.
    pub fn take_events(&mut self) -> Vec<QueueEvent> {
        std::mem::take(&mut self.pending_events)
    }

    /// Discard all pending entries (job reached a terminal state)
    pub fn clear(&mut self) {
        self.heap.clear();
        self.entries.clear();
        self.pending_events.clear();
    }

    fn recent_host_fetches(&mut self, host: &str, now: i64) -> u64 {
        let cutoff = now - self.config.host_window_ms;
        match self.host_fetches.get_mut(host) {
            Some(times) => {
                while times.front().is_some_and(|&t| t < cutoff) {
                    times.pop_front();
                }
                times.len() as u64
            }
            None => 0,
        }
    }

    fn note_host_fetch(&mut self, host: &str, now: i64) {
        self.host_fetches.entry(host.to_string()).or_default().push_back(now);
    }

    fn record_event(&mut self, action: QueueAction, url: &str, entry: Option<&FrontierEntry>, reason: Option<&str>) {
        self.pending_events.push(QueueEvent {
            id: 0,
            task_id: self.task_id.clone(),
            ts: now_ms(),
            action,
            url: url.to_string(),
            depth: entry.map(|e| e.depth),
            host: entry.map(|e| e.host.clone()),
            reason: reason
                .map(str::to_string)
                .or_else(|| entry.map(|e| e.source.clone())),
            queue_size: Some(self.entries.len() as u64),
            role: entry.map(|e| e.source.clone()),
            depth_bucket: entry.map(|e| e.depth_bucket().to_string()),
        });
    }
}
