use std::time::Duration;

use thiserror::Error;

use crate::core::task::TaskId;
use crate::core::RunId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Cycle detected among tasks: {}", join_ids(.members))]
    CycleDetected { members: Vec<TaskId> },

    #[error("Isolation allocation failed for task {task_id}: {reason}")]
    IsolationAllocationFailed { task_id: TaskId, reason: String },

    #[error("Task {task_id} timed out after {timeout:?}")]
    ExecutionTimeout { task_id: TaskId, timeout: Duration },

    #[error("Task {task_id} failed: {message}")]
    ExecutionError { task_id: TaskId, message: String },

    #[error("Validation failed for layer {layer}: {reason}")]
    ValidationFailed { layer: usize, reason: String },

    #[error("Unresolved conflicts in layer {layer}: {}", .keys.join(", "))]
    ConflictUnresolved { layer: usize, keys: Vec<String> },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid transition for task {task_id} from {from}")]
    InvalidTransition { task_id: TaskId, from: String },
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Backpressure signals that the caller should retry rather than fail.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::IsolationAllocationFailed { .. })
    }

    /// Errors that stop the whole run rather than a single task.
    pub fn is_layer_fatal(&self) -> bool {
        matches!(
            self,
            Error::ValidationFailed { .. } | Error::ConflictUnresolved { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
