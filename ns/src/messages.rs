//! Commands processed by the store actor

use tokio::sync::oneshot;

use crate::error::StoreResult;
use crate::places::{DomainSignals, PlaceHubRecord, PlaceRecord};
use crate::task::{ProgressUpdate, StatusChange, TaskFilter, TaskRow, TaskStatus};
use crate::telemetry::{Observation, PlannerStageEvent, QueueEvent};

/// Aggregate task counts for status displays
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct TaskCounts {
    pub total: u64,
    pub pending: u64,
    pub resuming: u64,
    pub running: u64,
    pub paused: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl TaskCounts {
    pub(crate) fn from_pairs(pairs: &[(TaskStatus, u64)]) -> Self {
        let mut counts = Self::default();
        for &(status, n) in pairs {
            counts.total += n;
            match status {
                TaskStatus::Pending => counts.pending = n,
                TaskStatus::Resuming => counts.resuming = n,
                TaskStatus::Running => counts.running = n,
                TaskStatus::Paused => counts.paused = n,
                TaskStatus::Completed => counts.completed = n,
                TaskStatus::Failed => counts.failed = n,
                TaskStatus::Cancelled => counts.cancelled = n,
            }
        }
        counts
    }
}

/// A command sent to the store actor
pub(crate) enum StoreCommand {
    CreateTask {
        row: TaskRow,
        reply: oneshot::Sender<StoreResult<TaskRow>>,
    },
    GetTask {
        id: String,
        reply: oneshot::Sender<StoreResult<Option<TaskRow>>>,
    },
    UpdateStatus {
        id: String,
        status: TaskStatus,
        change: StatusChange,
        reply: oneshot::Sender<StoreResult<TaskRow>>,
    },
    UpdateProgress {
        id: String,
        update: ProgressUpdate,
        reply: oneshot::Sender<StoreResult<TaskRow>>,
    },
    ListTasks {
        filter: TaskFilter,
        reply: oneshot::Sender<StoreResult<Vec<TaskRow>>>,
    },
    FindInterrupted {
        reply: oneshot::Sender<StoreResult<Vec<TaskRow>>>,
    },
    DeleteTask {
        id: String,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Counts {
        reply: oneshot::Sender<StoreResult<TaskCounts>>,
    },
    AppendQueueEvent {
        event: QueueEvent,
        reply: oneshot::Sender<StoreResult<i64>>,
    },
    AppendProblem {
        observation: Observation,
        reply: oneshot::Sender<StoreResult<i64>>,
    },
    AppendMilestone {
        observation: Observation,
        reply: oneshot::Sender<StoreResult<i64>>,
    },
    AppendPlannerStage {
        event: PlannerStageEvent,
        reply: oneshot::Sender<StoreResult<i64>>,
    },
    ListQueueEvents {
        task_id: String,
        limit: usize,
        reply: oneshot::Sender<StoreResult<Vec<QueueEvent>>>,
    },
    ListProblems {
        task_id: String,
        limit: usize,
        reply: oneshot::Sender<StoreResult<Vec<Observation>>>,
    },
    ListMilestones {
        task_id: String,
        limit: usize,
        reply: oneshot::Sender<StoreResult<Vec<Observation>>>,
    },
    ListPlannerStages {
        task_id: String,
        limit: usize,
        reply: oneshot::Sender<StoreResult<Vec<PlannerStageEvent>>>,
    },
    UpsertPlaces {
        places: Vec<PlaceRecord>,
        reply: oneshot::Sender<StoreResult<usize>>,
    },
    ListPlaces {
        kind: Option<String>,
        limit: usize,
        reply: oneshot::Sender<StoreResult<Vec<PlaceRecord>>>,
    },
    CountPlaces {
        reply: oneshot::Sender<StoreResult<u64>>,
    },
    InsertPlaceHub {
        hub: PlaceHubRecord,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    ListPlaceHubs {
        domain: String,
        limit: usize,
        reply: oneshot::Sender<StoreResult<Vec<PlaceHubRecord>>>,
    },
    DomainSignals {
        domain: String,
        reply: oneshot::Sender<StoreResult<DomainSignals>>,
    },
    Shutdown,
}
