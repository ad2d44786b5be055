//! Task orchestrator - lifecycle manager for crawl jobs and background tasks
//!
//! - [`registry`] - task type registrations (frozen at start)
//! - [`core`] - scheduler, active-task handles, recovery pass

pub mod core;
pub mod registry;

pub use core::{Orchestrator, OrchestratorConfig, OrchestratorStatus};
pub use registry::{
    BackgroundTask, CRAWL_TASK_TYPE, RegistrationOptions, TaskContext, TaskFactory, TaskRegistration, TaskRegistry,
};

use newsstore::{StoreError, TaskStatus};
use thiserror::Error;

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("task type already registered: {0}")]
    DuplicateTaskType(String),

    #[error("task type {0} is reserved")]
    ReservedTaskType(String),

    #[error("task type registrations are closed once the orchestrator has started")]
    RegistryFrozen,

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task {id} is already terminal ({status})")]
    Terminal { id: String, status: TaskStatus },

    #[error("task {0} is active; cancel it before deleting")]
    Active(String),

    #[error("invalid task config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
