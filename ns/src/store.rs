//! TaskStore - actor that owns the SQLite database
//!
//! All durable mutations flow through a single actor task, which serializes
//! writes and retries transient lock contention with bounded backoff. Callers
//! hold a cheap cloneable [`TaskStore`] handle.

use std::path::Path;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::error::{StoreError, StoreResult};
use crate::messages::{StoreCommand, TaskCounts};
use crate::places::{DomainSignals, PlaceHubRecord, PlaceRecord};
use crate::task::{ProgressUpdate, StatusChange, TaskFilter, TaskRow, TaskStatus};
use crate::telemetry::{Observation, PlannerStageEvent, QueueEvent};

/// Retry budget for transient SQLite errors (lock contention, WAL races)
const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE_MS: u64 = 50;
const RETRY_CAP_MS: u64 = 500;

/// Handle to the store actor
#[derive(Clone)]
pub struct TaskStore {
    tx: mpsc::Sender<StoreCommand>,
}

impl TaskStore {
    /// Open (creating if absent) the store at `path` and spawn the actor
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        debug!(path = %path.as_ref().display(), "TaskStore::open");
        let db = Db::open(path.as_ref())?;
        Ok(Self::spawn_actor(db))
    }

    /// In-memory store for tests
    pub fn in_memory() -> StoreResult<Self> {
        let db = Db::open_in_memory()?;
        Ok(Self::spawn_actor(db))
    }

    fn spawn_actor(db: Db) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(db, rx));
        info!("TaskStore actor spawned");
        Self { tx }
    }

    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> StoreCommand,
    ) -> StoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| StoreError::Closed)?;
        reply_rx.await.map_err(|_| StoreError::Closed)?
    }

    // === tasks ===

    /// Insert a pending row with a generated id
    pub async fn create_task(&self, task_type: &str, config: serde_json::Value) -> StoreResult<TaskRow> {
        let row = TaskRow::new(task_type, config);
        self.send(|reply| StoreCommand::CreateTask { row, reply }).await
    }

    /// Insert a pending row with a caller-supplied id; `Duplicate` if taken
    pub async fn create_task_with_id(
        &self,
        id: &str,
        task_type: &str,
        config: serde_json::Value,
    ) -> StoreResult<TaskRow> {
        let row = TaskRow::with_id(id, task_type, config);
        self.send(|reply| StoreCommand::CreateTask { row, reply }).await
    }

    pub async fn get_task(&self, id: &str) -> StoreResult<Option<TaskRow>> {
        let id = id.to_string();
        self.send(|reply| StoreCommand::GetTask { id, reply }).await
    }

    /// Get a task, returning `NotFound` when absent
    pub async fn get_task_required(&self, id: &str) -> StoreResult<TaskRow> {
        self.get_task(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Atomic status transition; rejects mutation of terminal rows
    pub async fn update_status(&self, id: &str, status: TaskStatus, change: StatusChange) -> StoreResult<TaskRow> {
        let id = id.to_string();
        self.send(|reply| StoreCommand::UpdateStatus { id, status, change, reply })
            .await
    }

    /// Partial progress update
    pub async fn update_progress(&self, id: &str, update: ProgressUpdate) -> StoreResult<TaskRow> {
        let id = id.to_string();
        self.send(|reply| StoreCommand::UpdateProgress { id, update, reply }).await
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> StoreResult<Vec<TaskRow>> {
        self.send(|reply| StoreCommand::ListTasks { filter, reply }).await
    }

    /// Tasks that were active when the process last died
    pub async fn find_interrupted_tasks(&self) -> StoreResult<Vec<TaskRow>> {
        self.send(|reply| StoreCommand::FindInterrupted { reply }).await
    }

    /// Explicit delete; the only mutation allowed on terminal rows
    pub async fn delete_task(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.send(|reply| StoreCommand::DeleteTask { id, reply }).await
    }

    pub async fn task_counts(&self) -> StoreResult<TaskCounts> {
        self.send(|reply| StoreCommand::Counts { reply }).await
    }

    // === telemetry (best-effort at call sites) ===

    pub async fn append_queue_event(&self, event: QueueEvent) -> StoreResult<i64> {
        self.send(|reply| StoreCommand::AppendQueueEvent { event, reply }).await
    }

    pub async fn append_problem(&self, observation: Observation) -> StoreResult<i64> {
        self.send(|reply| StoreCommand::AppendProblem { observation, reply }).await
    }

    pub async fn append_milestone(&self, observation: Observation) -> StoreResult<i64> {
        self.send(|reply| StoreCommand::AppendMilestone { observation, reply }).await
    }

    pub async fn append_planner_stage(&self, event: PlannerStageEvent) -> StoreResult<i64> {
        self.send(|reply| StoreCommand::AppendPlannerStage { event, reply }).await
    }

    pub async fn list_queue_events(&self, task_id: &str, limit: usize) -> StoreResult<Vec<QueueEvent>> {
        let task_id = task_id.to_string();
        self.send(|reply| StoreCommand::ListQueueEvents { task_id, limit, reply }).await
    }

    pub async fn list_problems(&self, task_id: &str, limit: usize) -> StoreResult<Vec<Observation>> {
        let task_id = task_id.to_string();
        self.send(|reply| StoreCommand::ListProblems { task_id, limit, reply }).await
    }

    pub async fn list_milestones(&self, task_id: &str, limit: usize) -> StoreResult<Vec<Observation>> {
        let task_id = task_id.to_string();
        self.send(|reply| StoreCommand::ListMilestones { task_id, limit, reply }).await
    }

    pub async fn list_planner_stages(&self, task_id: &str, limit: usize) -> StoreResult<Vec<PlannerStageEvent>> {
        let task_id = task_id.to_string();
        self.send(|reply| StoreCommand::ListPlannerStages { task_id, limit, reply }).await
    }

    // === places and place hubs ===

    /// Batch-import gazetteer places; returns how many were new
    pub async fn upsert_places(&self, places: Vec<PlaceRecord>) -> StoreResult<usize> {
        self.send(|reply| StoreCommand::UpsertPlaces { places, reply }).await
    }

    pub async fn list_places(&self, kind: Option<&str>, limit: usize) -> StoreResult<Vec<PlaceRecord>> {
        let kind = kind.map(str::to_string);
        self.send(|reply| StoreCommand::ListPlaces { kind, limit, reply }).await
    }

    pub async fn count_places(&self) -> StoreResult<u64> {
        self.send(|reply| StoreCommand::CountPlaces { reply }).await
    }

    /// Insert a hub guess; false when (domain, url) already exists
    pub async fn insert_place_hub(&self, hub: PlaceHubRecord) -> StoreResult<bool> {
        self.send(|reply| StoreCommand::InsertPlaceHub { hub, reply }).await
    }

    pub async fn list_place_hubs(&self, domain: &str, limit: usize) -> StoreResult<Vec<PlaceHubRecord>> {
        let domain = domain.to_string();
        self.send(|reply| StoreCommand::ListPlaceHubs { domain, limit, reply }).await
    }

    /// Prior-signal summary used for readiness judgments
    pub async fn domain_signals(&self, domain: &str) -> StoreResult<DomainSignals> {
        let domain = domain.to_string();
        self.send(|reply| StoreCommand::DomainSignals { domain, reply }).await
    }

    /// Shut down the actor; pending commands are dropped
    pub async fn shutdown(&self) -> StoreResult<()> {
        self.tx
            .send(StoreCommand::Shutdown)
            .await
            .map_err(|_| StoreError::Closed)
    }
}

/// Run `op` with bounded exponential backoff on transient errors
async fn with_retry<T>(db: &mut Db, mut op: impl FnMut(&mut Db) -> StoreResult<T>) -> StoreResult<T> {
    let mut delay = RETRY_BASE_MS;
    for attempt in 1..=RETRY_ATTEMPTS {
        match op(db) {
            Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                warn!(attempt, delay_ms = delay, error = %e, "transient store error, retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay = (delay * 2).min(RETRY_CAP_MS);
            }
            other => return other,
        }
    }
    unreachable!("retry loop always returns on the final attempt")
}

/// The actor loop that owns the database and processes commands
async fn actor_loop(mut db: Db, mut rx: mpsc::Receiver<StoreCommand>) {
    debug!("TaskStore actor started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::CreateTask { row, reply } => {
                let result = with_retry(&mut db, |db| db.create_task(&row).map(|_| row.clone())).await;
                let _ = reply.send(result);
            }
            StoreCommand::GetTask { id, reply } => {
                let _ = reply.send(db.get_task(&id));
            }
            StoreCommand::UpdateStatus { id, status, change, reply } => {
                let result = with_retry(&mut db, |db| db.update_status(&id, status, &change)).await;
                let _ = reply.send(result);
            }
            StoreCommand::UpdateProgress { id, update, reply } => {
                let result = with_retry(&mut db, |db| db.update_progress(&id, &update)).await;
                let _ = reply.send(result);
            }
            StoreCommand::ListTasks { filter, reply } => {
                let _ = reply.send(db.list_tasks(&filter));
            }
            StoreCommand::FindInterrupted { reply } => {
                let _ = reply.send(db.find_interrupted());
            }
            StoreCommand::DeleteTask { id, reply } => {
                let result = with_retry(&mut db, |db| db.delete_task(&id)).await;
                let _ = reply.send(result);
            }
            StoreCommand::Counts { reply } => {
                let _ = reply.send(db.count_by_status().map(|pairs| TaskCounts::from_pairs(&pairs)));
            }
            StoreCommand::AppendQueueEvent { event, reply } => {
                let result = with_retry(&mut db, |db| db.append_queue_event(&event)).await;
                let _ = reply.send(result);
            }
            StoreCommand::AppendProblem { observation, reply } => {
                let result = with_retry(&mut db, |db| db.append_problem(&observation)).await;
                let _ = reply.send(result);
            }
            StoreCommand::AppendMilestone { observation, reply } => {
                let result = with_retry(&mut db, |db| db.append_milestone(&observation)).await;
                let _ = reply.send(result);
            }
            StoreCommand::AppendPlannerStage { event, reply } => {
                let result = with_retry(&mut db, |db| db.append_planner_stage(&event)).await;
                let _ = reply.send(result);
            }
            StoreCommand::ListQueueEvents { task_id, limit, reply } => {
                let _ = reply.send(db.list_queue_events(&task_id, limit));
            }
            StoreCommand::ListProblems { task_id, limit, reply } => {
                let _ = reply.send(db.list_problems(&task_id, limit));
            }
            StoreCommand::ListMilestones { task_id, limit, reply } => {
                let _ = reply.send(db.list_milestones(&task_id, limit));
            }
            StoreCommand::ListPlannerStages { task_id, limit, reply } => {
                let _ = reply.send(db.list_planner_stages(&task_id, limit));
            }
            StoreCommand::UpsertPlaces { places, reply } => {
                let result = with_retry(&mut db, |db| db.upsert_places(&places)).await;
                let _ = reply.send(result);
            }
            StoreCommand::ListPlaces { kind, limit, reply } => {
                let _ = reply.send(db.list_places(kind.as_deref(), limit));
            }
            StoreCommand::CountPlaces { reply } => {
                let _ = reply.send(db.count_places());
            }
            StoreCommand::InsertPlaceHub { hub, reply } => {
                let result = with_retry(&mut db, |db| db.insert_place_hub(&hub)).await;
                let _ = reply.send(result);
            }
            StoreCommand::ListPlaceHubs { domain, limit, reply } => {
                let _ = reply.send(db.list_place_hubs(&domain, limit));
            }
            StoreCommand::DomainSignals { domain, reply } => {
                let _ = reply.send(db.domain_signals(&domain));
            }
            StoreCommand::Shutdown => {
                info!("TaskStore shutting down");
                break;
            }
        }
    }

    debug!("TaskStore actor stopped");
}
