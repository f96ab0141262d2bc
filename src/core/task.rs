//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of work handed to worker agents. Each task
//! declares the ids it depends on, an opaque payload describing what to
//! execute, and an estimated complexity used by the scaling policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a task within a run.
///
/// Ids are caller-supplied strings. Their ascending order is the global
/// tie-break used for layer ordering and conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a task identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created, dependencies not yet satisfied.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a worker slot.
    Ready,
    /// Task is being executed by an agent.
    Running,
    /// Task completed successfully.
    Succeeded,
    /// Task failed. Not retried unless the caller resets it.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Task exceeded its execution timeout.
    TimedOut,
}

impl TaskStatus {
    /// Short status name without the error detail.
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A task submission record: `{id, dependencies[], payload, complexity}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_complexity")]
    pub complexity: f64,
}

fn default_complexity() -> f64 {
    1.0
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(id),
            dependencies: Vec::new(),
            payload,
            complexity: default_complexity(),
        }
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(TaskId::new(id));
        self
    }

    pub fn with_complexity(mut self, complexity: f64) -> Self {
        self.complexity = complexity;
        self
    }
}

/// A single task in the execution DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Ids of tasks that must succeed before this one can run.
    pub dependencies: Vec<TaskId>,
    /// Opaque description of what to execute.
    pub payload: serde_json::Value,
    /// Estimated complexity score.
    pub complexity: f64,
    /// Current execution status.
    pub status: TaskStatus,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task started execution.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with no dependencies.
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::from(TaskSpec::new(id, payload))
    }

    /// Mark the task as ready for execution.
    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Start the task execution.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
    }

    /// Mark the task as successfully completed.
    pub fn succeed(&mut self) {
        self.status = TaskStatus::Succeeded;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as failed with an error message.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as timed out.
    pub fn time_out(&mut self) {
        self.status = TaskStatus::TimedOut;
        self.completed_at = Some(Utc::now());
    }

    /// Return the task to pending so it can be dispatched again.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Succeeded | TaskStatus::Failed { .. } | TaskStatus::TimedOut
        )
    }

    /// Failed and timed-out tasks block their dependents identically.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self.status, TaskStatus::Failed { .. } | TaskStatus::TimedOut)
    }

    /// Check if the task can be started (Pending or Ready).
    pub fn can_start(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Ready)
    }

    /// The submission record this task was created from.
    pub fn spec(&self) -> TaskSpec {
        TaskSpec {
            id: self.id.clone(),
            dependencies: self.dependencies.clone(),
            payload: self.payload.clone(),
            complexity: self.complexity,
        }
    }
}

impl From<TaskSpec> for Task {
    fn from(spec: TaskSpec) -> Self {
        Self {
            id: spec.id,
            dependencies: spec.dependencies,
            payload: spec.payload,
            complexity: spec.complexity,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}
