//! Event types fanned out by the bus
//!
//! Topics form a closed set. Every published event is wrapped in an
//! [`Envelope`] carrying a per-publisher sequence number so subscribers can
//! detect gaps after an overflow.

use newsstore::{Observation, PlannerStageEvent, QueueEvent, TaskRow, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of bus topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    TaskCreated,
    TaskStatusChanged,
    TaskProgress,
    TaskCompleted,
    TaskError,
    TaskProblem,
    QueueEvent,
    PlannerStage,
    Milestone,
    JobListChanged,
}

impl Topic {
    /// All topics, for subscribe-everything consumers
    pub const ALL: [Topic; 10] = [
        Topic::TaskCreated,
        Topic::TaskStatusChanged,
        Topic::TaskProgress,
        Topic::TaskCompleted,
        Topic::TaskError,
        Topic::TaskProblem,
        Topic::QueueEvent,
        Topic::PlannerStage,
        Topic::Milestone,
        Topic::JobListChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::TaskCreated => "task-created",
            Topic::TaskStatusChanged => "task-status-changed",
            Topic::TaskProgress => "task-progress",
            Topic::TaskCompleted => "task-completed",
            Topic::TaskError => "task-error",
            Topic::TaskProblem => "task-problem",
            Topic::QueueEvent => "queue-event",
            Topic::PlannerStage => "planner-stage",
            Topic::Milestone => "milestone",
            Topic::JobListChanged => "job-list-changed",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A bus event; the variant determines the topic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BusEvent {
    TaskCreated {
        task: TaskRow,
    },
    TaskStatusChanged {
        task_id: String,
        status: TaskStatus,
        error_message: Option<String>,
    },
    TaskProgress {
        task_id: String,
        current: u64,
        total: u64,
        message: Option<String>,
        stage: Option<String>,
    },
    TaskCompleted {
        task_id: String,
        success: bool,
        status: TaskStatus,
        /// Final summary from the last seen progress plus aggregate stats
        summary: Value,
    },
    TaskError {
        task_id: String,
        message: String,
        fatal: bool,
    },
    TaskProblem {
        problem: Observation,
    },
    QueueEvent {
        event: QueueEvent,
    },
    PlannerStage {
        stage: PlannerStageEvent,
    },
    Milestone {
        milestone: Observation,
    },
    JobListChanged {
        active: Vec<String>,
    },
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::TaskCreated { .. } => Topic::TaskCreated,
            BusEvent::TaskStatusChanged { .. } => Topic::TaskStatusChanged,
            BusEvent::TaskProgress { .. } => Topic::TaskProgress,
            BusEvent::TaskCompleted { .. } => Topic::TaskCompleted,
            BusEvent::TaskError { .. } => Topic::TaskError,
            BusEvent::TaskProblem { .. } => Topic::TaskProblem,
            BusEvent::QueueEvent { .. } => Topic::QueueEvent,
            BusEvent::PlannerStage { .. } => Topic::PlannerStage,
            BusEvent::Milestone { .. } => Topic::Milestone,
            BusEvent::JobListChanged { .. } => Topic::JobListChanged,
        }
    }

    /// The task this event concerns, if any
    pub fn task_id(&self) -> Option<&str> {
        match self {
            BusEvent::TaskCreated { task } => Some(&task.id),
            BusEvent::TaskStatusChanged { task_id, .. }
            | BusEvent::TaskProgress { task_id, .. }
            | BusEvent::TaskCompleted { task_id, .. }
            | BusEvent::TaskError { task_id, .. } => Some(task_id),
            BusEvent::TaskProblem { problem } => Some(&problem.task_id),
            BusEvent::QueueEvent { event } => Some(&event.task_id),
            BusEvent::PlannerStage { stage } => Some(&stage.task_id),
            BusEvent::Milestone { milestone } => Some(&milestone.task_id),
            BusEvent::JobListChanged { .. } => None,
        }
    }
}

/// A published event with its sequence number and timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Monotonically increasing per publisher; gaps imply loss
    pub seq: u64,
    /// Unix milliseconds
    pub ts: i64,
    #[serde(flatten)]
    pub event: BusEvent,
}

/// What a subscriber actually receives
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(Envelope),
    /// The subscriber fell behind and `missed` events were dropped
    Lagged { missed: u64 },
    /// Idle keep-alive; emitted when nothing has flowed for the interval
    Heartbeat { ts: i64 },
}
