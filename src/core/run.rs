//! Run identity and run-level state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tracking identifier for one DAG run.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output and namespace names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new unique run identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Status of a run in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RunState {
    /// Submitted, not yet started.
    #[default]
    Pending,
    /// The scheduler is working through the layers.
    Running,
    /// Every layer was processed. Individual tasks may still have failed.
    Completed,
    /// A layer-fatal error stopped progression; needs external intervention.
    Halted {
        /// Layer whose aggregation failed.
        layer: usize,
        /// Why the layer failed.
        reason: String,
    },
    /// Cancelled by the caller.
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Pending | RunState::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::Running => write!(f, "running"),
            RunState::Completed => write!(f, "completed"),
            RunState::Halted { layer, reason } => {
                write!(f, "halted at layer {}: {}", layer, reason)
            }
            RunState::Cancelled => write!(f, "cancelled"),
        }
    }
}
