//! Progress sink with publish coalescing
//!
//! Every task reports through a [`ProgressSink`]. Each report is persisted,
//! but at most one `task-progress` bus event goes out per 100 ms per task;
//! the latest value wins. The sink also performs the resuming-to-running
//! flip: the first progress report from a recovered task proves its runner
//! is alive again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use newsstore::{ProgressUpdate, StatusChange, StoreResult, TaskRow, TaskStatus, TaskStore};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::events::EventBus;

/// Minimum interval between published progress events per task
pub const COALESCE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct PendingProgress {
    current: u64,
    total: u64,
    message: Option<String>,
    stage: Option<String>,
}

#[derive(Debug, Default)]
struct CoalesceState {
    last_publish: Option<Instant>,
    pending: Option<PendingProgress>,
    flush_scheduled: bool,
}

/// Persists progress and publishes coalesced bus events
#[derive(Clone)]
pub struct ProgressSink {
    store: TaskStore,
    bus: Arc<EventBus>,
    task_id: String,
    interval: Duration,
    /// Set while the task is resuming; the first report flips it to running
    mark_running_on_progress: Arc<AtomicBool>,
    state: Arc<Mutex<CoalesceState>>,
}

impl ProgressSink {
    pub fn new(store: TaskStore, bus: Arc<EventBus>, task_id: impl Into<String>) -> Self {
        Self::with_interval(store, bus, task_id, COALESCE_INTERVAL)
    }

    pub fn with_interval(
        store: TaskStore,
        bus: Arc<EventBus>,
        task_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            task_id: task_id.into(),
            interval,
            mark_running_on_progress: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(CoalesceState::default())),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Arm the resuming-to-running flip (set during recovery)
    pub fn mark_resuming(&self) {
        self.mark_running_on_progress.store(true, Ordering::SeqCst);
    }

    /// Persist a progress report and publish it (coalesced)
    pub async fn update(&self, update: ProgressUpdate) -> StoreResult<TaskRow> {
        if self.mark_running_on_progress.swap(false, Ordering::SeqCst) {
            debug!(task_id = %self.task_id, "first progress after resume, moving to running");
            match self
                .store
                .update_status(&self.task_id, TaskStatus::Running, StatusChange::default())
                .await
            {
                Ok(row) => self.bus.task_status_changed(&self.task_id, row.status, None),
                Err(e) => warn!(task_id = %self.task_id, error = %e, "resume flip failed"),
            }
        }

        let row = self.store.update_progress(&self.task_id, update).await?;
        let stage = row.metadata.get("stage").and_then(|v| v.as_str()).map(String::from);
        self.publish_coalesced(PendingProgress {
            current: row.progress_current,
            total: row.progress_total,
            message: row.progress_message.clone(),
            stage,
        })
        .await;
        Ok(row)
    }

    async fn publish_coalesced(&self, progress: PendingProgress) {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let due = match state.last_publish {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };

        if due && !state.flush_scheduled {
            state.last_publish = Some(now);
            self.publish(&progress);
            return;
        }

        // Too soon: remember the latest value and schedule one trailing flush
        state.pending = Some(progress);
        if !state.flush_scheduled {
            state.flush_scheduled = true;
            let sink = self.clone();
            let wait = state
                .last_publish
                .map(|last| self.interval.saturating_sub(now.duration_since(last)))
                .unwrap_or(self.interval);
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                let mut state = sink.state.lock().await;
                if let Some(pending) = state.pending.take() {
                    state.last_publish = Some(Instant::now());
                    sink.publish(&pending);
                }
                state.flush_scheduled = false;
            });
        }
    }

    fn publish(&self, progress: &PendingProgress) {
        self.bus.task_progress(
            &self.task_id,
            progress.current,
            progress.total,
            progress.message.clone(),
            progress.stage.clone(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Delivery, Topic};
    use serde_json::json;

    async fn fixture(interval: Duration) -> (TaskStore, Arc<EventBus>, ProgressSink, String) {
        let store = TaskStore::in_memory().unwrap();
        let bus = Arc::new(EventBus::with_defaults());
        let row = store.create_task("compress", json!({})).await.unwrap();
        store
            .update_status(&row.id, TaskStatus::Running, StatusChange::default())
            .await
            .unwrap();
        let sink = ProgressSink::with_interval(store.clone(), bus.clone(), &row.id, interval);
        (store, bus, sink, row.id)
    }

    #[tokio::test]
    async fn test_update_persists_and_publishes() {
        let (store, bus, sink, id) = fixture(Duration::from_millis(0)).await;
        let mut sub = bus.subscribe(&[Topic::TaskProgress]);

        sink.update(ProgressUpdate::counters(1, 3)).await.unwrap();

        let row = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(row.progress_current, 1);

        match sub.recv().await.unwrap() {
            Delivery::Event(env) => assert_eq!(env.event.topic(), Topic::TaskProgress),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_coalescing_latest_wins() {
        let (_store, bus, sink, _id) = fixture(Duration::from_millis(50)).await;
        let mut sub = bus.subscribe(&[Topic::TaskProgress]);

        for i in 1..=10u64 {
            sink.update(ProgressUpdate::counters(i, 10)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(120)).await;

        let mut published = Vec::new();
        while let Some(Delivery::Event(env)) = sub.try_recv() {
            if let crate::events::BusEvent::TaskProgress { current, .. } = env.event {
                published.push(current);
            }
        }

        // Far fewer events than updates, and the last one carries the final value
        assert!(published.len() <= 3, "published {} events", published.len());
        assert_eq!(*published.last().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_resume_flip_on_first_progress() {
        let store = TaskStore::in_memory().unwrap();
        let bus = Arc::new(EventBus::with_defaults());
        let row = store.create_task("compress", json!({})).await.unwrap();
        store
            .update_status(&row.id, TaskStatus::Running, StatusChange::default())
            .await
            .unwrap();
        store
            .update_status(&row.id, TaskStatus::Resuming, StatusChange::default())
            .await
            .unwrap();

        let sink = ProgressSink::with_interval(store.clone(), bus.clone(), &row.id, Duration::from_millis(0));
        sink.mark_resuming();

        sink.update(ProgressUpdate::counters(43, 100)).await.unwrap();

        let row = store.get_task(&row.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Running);
        assert!(row.resume_started_at.is_none());
        assert_eq!(row.progress_current, 43);
    }

    #[tokio::test]
    async fn test_progress_on_terminal_task_rejected() {
        let (store, _bus, sink, id) = fixture(Duration::from_millis(0)).await;
        store
            .update_status(&id, TaskStatus::Completed, StatusChange::default())
            .await
            .unwrap();

        let err = sink.update(ProgressUpdate::counters(9, 10)).await.unwrap_err();
        assert!(matches!(err, newsstore::StoreError::InvalidTransition { .. }));
    }
}
