//! Task row type and lifecycle state machine
//!
//! A task is the unit of durable work: crawl jobs and background tasks share
//! this row. Status transitions are validated here so that every mutation
//! path (store actor, tests) enforces the same machine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Current Unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for a scheduler slot
    #[default]
    Pending,
    /// Found active at boot, re-establishing its runner
    Resuming,
    /// Actively executing
    Running,
    /// Caller paused; resumable
    Paused,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Caller requested stop
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Resuming => write!(f, "resuming"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "resuming" => Ok(Self::Resuming),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Serde(format!("unknown task status: {other}"))),
        }
    }
}

impl TaskStatus {
    /// Terminal states never mutate again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active states are recovered after a crash
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Resuming)
    }

    /// Check whether a transition is legal
    ///
    /// Cancellation is allowed from any non-terminal state. All other
    /// transitions only require that the pre-state is non-terminal; the
    /// orchestrator enforces the finer-grained ordering.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if *self == next {
            // Idempotent re-assertion of the current state is harmless
            return true;
        }
        match next {
            TaskStatus::Pending => false,
            _ => true,
        }
    }
}

/// A durable task row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    /// Unique identifier (UUID v7, never reused)
    pub id: String,

    /// Task type key into the orchestrator registry
    pub task_type: String,

    /// Lifecycle status
    pub status: TaskStatus,

    /// Progress numerator
    pub progress_current: u64,

    /// Progress denominator; 0 means indeterminate
    pub progress_total: u64,

    /// Short human progress string
    pub progress_message: Option<String>,

    /// Type-specific configuration payload
    pub config: Value,

    /// Payload written by the task implementation (stage label, stats)
    pub metadata: Value,

    /// Error text for failed tasks
    pub error_message: Option<String>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Set once, on first transition into running
    pub started_at: Option<i64>,

    /// Last mutation timestamp; strictly monotonic per row
    pub updated_at: i64,

    /// Set when the task reaches a terminal state
    pub completed_at: Option<i64>,

    /// Non-null exactly while status is resuming
    pub resume_started_at: Option<i64>,
}

impl TaskRow {
    /// Create a fresh pending row with a generated id
    pub fn new(task_type: impl Into<String>, config: Value) -> Self {
        Self::with_id(uuid::Uuid::now_v7().to_string(), task_type, config)
    }

    /// Create a fresh pending row with a caller-supplied id
    pub fn with_id(id: impl Into<String>, task_type: impl Into<String>, config: Value) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            progress_current: 0,
            progress_total: 0,
            progress_message: None,
            config,
            metadata: Value::Null,
            error_message: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            completed_at: None,
            resume_started_at: None,
        }
    }

    /// True when no further mutation is allowed
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fraction complete, if determinate
    pub fn progress_fraction(&self) -> Option<f64> {
        if self.progress_total == 0 {
            None
        } else {
            Some(self.progress_current as f64 / self.progress_total as f64)
        }
    }
}

/// Partial progress update; unset fields are left unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub current: Option<u64>,
    pub total: Option<u64>,
    pub message: Option<String>,
    pub metadata: Option<Value>,
}

impl ProgressUpdate {
    /// Update carrying only current/total counters
    pub fn counters(current: u64, total: u64) -> Self {
        Self {
            current: Some(current),
            total: Some(total),
            ..Default::default()
        }
    }
}

/// Extra fields attached to a status change
#[derive(Debug, Clone, Default)]
pub struct StatusChange {
    /// Error text, persisted for failed tasks
    pub error_message: Option<String>,
}

/// Filter for task listing
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub limit: Option<usize>,
    /// Newest-first when true (the default)
    pub newest_first: bool,
}

impl TaskFilter {
    pub fn by_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            newest_first: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Resuming,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            let parsed: TaskStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Resuming.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn test_cancel_from_any_non_terminal() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Resuming,
            TaskStatus::Running,
            TaskStatus::Paused,
        ] {
            assert!(status.can_transition_to(TaskStatus::Cancelled), "{status}");
        }
    }

    #[test]
    fn test_no_return_to_pending() {
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Paused.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_new_row_defaults() {
        let row = TaskRow::new("compress", serde_json::json!({"level": 3}));
        assert_eq!(row.status, TaskStatus::Pending);
        assert_eq!(row.progress_current, 0);
        assert_eq!(row.progress_total, 0);
        assert!(row.started_at.is_none());
        assert!(row.completed_at.is_none());
        assert!(row.resume_started_at.is_none());
        assert!(row.progress_fraction().is_none());
    }

    #[test]
    fn test_progress_fraction() {
        let mut row = TaskRow::new("compress", Value::Null);
        row.progress_current = 42;
        row.progress_total = 100;
        assert_eq!(row.progress_fraction(), Some(0.42));
    }

    #[test]
    fn test_row_serde_round_trip() {
        let row = TaskRow::with_id("task-1", "crawl", serde_json::json!({"url": "https://example.com/"}));
        let json = serde_json::to_string(&row).unwrap();
        let parsed: TaskRow = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "task-1");
        assert_eq!(parsed.config["url"], "https://example.com/");
    }

    const ALL_STATUSES: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Resuming,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    proptest::proptest! {
        /// Terminal states admit no transition; nothing returns to pending
        #[test]
        fn prop_transition_rules(from_idx in 0usize..7, to_idx in 0usize..7) {
            let from = ALL_STATUSES[from_idx];
            let to = ALL_STATUSES[to_idx];
            let allowed = from.can_transition_to(to);
            if from.is_terminal() {
                proptest::prop_assert!(!allowed);
            }
            if allowed && from != to {
                proptest::prop_assert!(to != TaskStatus::Pending);
            }
            // Cancellation is reachable from every non-terminal state
            if !from.is_terminal() {
                proptest::prop_assert!(from.can_transition_to(TaskStatus::Cancelled));
            }
        }
    }
}
