//! Task type registry
//!
//! Maps task type strings to constructor factories. Registrations are
//! process-local and must all happen before the orchestrator starts; the
//! registry freezes at start so the recovery pass and scheduler always see
//! the same type set.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use newsstore::TaskStore;

use crate::control::{CancelSignal, PauseGate};
use crate::progress::ProgressSink;

use super::OrchestratorError;

/// The reserved type key for external-worker crawl jobs
pub const CRAWL_TASK_TYPE: &str = "crawl";

/// Everything a task implementation gets to work with
pub struct TaskContext {
    pub store: TaskStore,
    pub task_id: String,
    pub config: Value,
    /// Observed at batch boundaries; set means stop promptly
    pub cancel: CancelSignal,
    /// Cooperative pause point for types that support pausing
    pub pause: PauseGate,
    pub progress: ProgressSink,
}

/// An in-process, cooperative unit of background work
///
/// Implementations own their working memory, report through
/// `ctx.progress`, and check `ctx.cancel` (and `ctx.pause`, if supported)
/// between batches.
#[async_trait]
pub trait BackgroundTask: Send {
    async fn run(&mut self, ctx: TaskContext) -> eyre::Result<()>;
}

/// Builds a task instance from its config payload
pub type TaskFactory = Arc<dyn Fn(&Value) -> eyre::Result<Box<dyn BackgroundTask>> + Send + Sync>;

/// Per-type registration options
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Pause/resume are honored (no-ops otherwise)
    pub supports_pause: bool,
}

#[derive(Clone)]
pub struct TaskRegistration {
    pub factory: TaskFactory,
    pub options: RegistrationOptions,
}

/// The registry itself
#[derive(Default)]
pub struct TaskRegistry {
    background: HashMap<String, TaskRegistration>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a background task factory
    pub fn register(
        &mut self,
        task_type: &str,
        factory: TaskFactory,
        options: RegistrationOptions,
    ) -> Result<(), OrchestratorError> {
        if task_type == CRAWL_TASK_TYPE {
            return Err(OrchestratorError::ReservedTaskType(task_type.to_string()));
        }
        if self.background.contains_key(task_type) {
            return Err(OrchestratorError::DuplicateTaskType(task_type.to_string()));
        }
        self.background.insert(task_type.to_string(), TaskRegistration { factory, options });
        Ok(())
    }

    /// Whether a type can be created (crawl is built in)
    pub fn contains(&self, task_type: &str) -> bool {
        task_type == CRAWL_TASK_TYPE || self.background.contains_key(task_type)
    }

    pub fn is_crawl(&self, task_type: &str) -> bool {
        task_type == CRAWL_TASK_TYPE
    }

    pub fn get(&self, task_type: &str) -> Option<&TaskRegistration> {
        self.background.get(task_type)
    }

    /// Registered background type keys, sorted
    pub fn background_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.background.keys().cloned().collect();
        types.sort();
        types
    }
}
