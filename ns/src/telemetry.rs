//! Append-only telemetry rows attached to a task
//!
//! Queue events, problems, milestones and planner stages are observational:
//! appends are best-effort and failures never propagate to the task itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Frontier action recorded in a queue event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueAction {
    Enqueue,
    Dequeue,
    Skip,
}

impl std::fmt::Display for QueueAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enqueue => write!(f, "enqueue"),
            Self::Dequeue => write!(f, "dequeue"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

impl std::str::FromStr for QueueAction {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueue" => Ok(Self::Enqueue),
            "dequeue" => Ok(Self::Dequeue),
            "skip" => Ok(Self::Skip),
            other => Err(StoreError::Serde(format!("unknown queue action: {other}"))),
        }
    }
}

/// A frontier mutation observed during a crawl
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    /// Row id; 0 until persisted
    #[serde(default)]
    pub id: i64,
    pub task_id: String,
    pub ts: i64,
    pub action: QueueAction,
    pub url: String,
    pub depth: Option<u32>,
    pub host: Option<String>,
    pub reason: Option<String>,
    pub queue_size: Option<u64>,
    pub role: Option<String>,
    pub depth_bucket: Option<String>,
}

/// A problem or milestone observation
///
/// Problems and milestones share a shape; they land in different tables and
/// different bus topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// Row id; 0 until persisted
    #[serde(default)]
    pub id: i64,
    pub task_id: String,
    pub ts: i64,
    /// Short machine kind, e.g. "silence", "stall", "cost-deviation"
    pub kind: String,
    /// Where it applies: "job", "host", "url", ...
    pub scope: Option<String>,
    /// The specific host/url the observation is about
    pub target: Option<String>,
    pub message: String,
    pub details: Option<Value>,
}

impl Observation {
    /// Build an observation for a task with the current timestamp
    pub fn new(task_id: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            task_id: task_id.into(),
            ts: crate::task::now_ms(),
            kind: kind.into(),
            scope: None,
            target: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>, target: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self.target = Some(target.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A planner decision record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerStageEvent {
    /// Row id; 0 until persisted
    #[serde(default)]
    pub id: i64,
    pub task_id: String,
    pub ts: i64,
    /// Stage label, e.g. "seed", "expand", "replan"
    pub stage: String,
    pub rationale: Option<String>,
    pub estimated_cost_ms: Option<u64>,
    /// What the planner decided, e.g. "emitted 12 candidates"
    pub decision: Option<String>,
}

impl PlannerStageEvent {
    pub fn new(task_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            id: 0,
            task_id: task_id.into(),
            ts: crate::task::now_ms(),
            stage: stage.into(),
            rationale: None,
            estimated_cost_ms: None,
            decision: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_action_round_trip() {
        for action in [QueueAction::Enqueue, QueueAction::Dequeue, QueueAction::Skip] {
            let parsed: QueueAction = action.to_string().parse().unwrap();
            assert_eq!(parsed, action);
        }
    }

    #[test]
    fn test_observation_builder() {
        let obs = Observation::new("task-1", "silence", "no output for 120s")
            .with_scope("job", "task-1")
            .with_details(serde_json::json!({"seconds": 120}));
        assert_eq!(obs.kind, "silence");
        assert_eq!(obs.scope.as_deref(), Some("job"));
        assert_eq!(obs.details.unwrap()["seconds"], 120);
    }

    #[test]
    fn test_queue_event_serde() {
        let ev = QueueEvent {
            id: 0,
            task_id: "task-1".into(),
            ts: 123,
            action: QueueAction::Enqueue,
            url: "https://example.com/world".into(),
            depth: Some(1),
            host: Some("example.com".into()),
            reason: Some("seed".into()),
            queue_size: Some(1),
            role: Some("hub".into()),
            depth_bucket: Some("shallow".into()),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"action\":\"enqueue\""));
        let parsed: QueueEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.url, "https://example.com/world");
    }
}
