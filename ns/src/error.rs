//! Store error types

use thiserror::Error;

use crate::task::TaskStatus;

/// Errors surfaced by the task store
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row with the given id
    #[error("task not found: {0}")]
    NotFound(String),

    /// Caller supplied an id that already exists
    #[error("task already exists: {0}")]
    Duplicate(String),

    /// Attempted a lifecycle transition the state machine forbids
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// Durable store is unusable after retry budget exhaustion
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Row payload failed to (de)serialize
    #[error("serialization error: {0}")]
    Serde(String),

    /// The store actor has shut down
    #[error("store channel closed")]
    Closed,
}

impl StoreError {
    /// True when the operation may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e.to_string())
    }
}

/// Result alias used throughout the store
pub type StoreResult<T> = Result<T, StoreError>;
