//! Core domain models for dagrun orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestrator: tasks, the dependency DAG built from them, and the
//! identity of a run.

pub mod dag;
pub mod run;
pub mod task;

pub use dag::{BlockReason, StatusCounts, TaskDAG};
pub use run::{RunId, RunState};
pub use task::{Task, TaskId, TaskSpec, TaskStatus};
