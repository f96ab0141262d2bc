pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod state;
pub mod util;

pub use config::Config;
pub use core::{RunId, RunState, Task, TaskDAG, TaskId, TaskSpec, TaskStatus};
pub use error::{Error, Result};
pub use orchestration::{Orchestrator, RunStatus, Submission, TaskCondition};
