//! Orchestration layer for dagrun.
//!
//! This module coordinates a run from submission to completion: isolation
//! contexts for every task, local and remote execution backends chosen by
//! the scaling policy, the dispatcher that runs a layer's agents under a
//! concurrency bound, the aggregator that merges their outputs and the
//! scheduler that walks the layers in order.

pub mod aggregator;
pub mod backend;
pub mod dispatcher;
pub mod isolation;
pub mod orchestrator;
pub mod remote;
pub mod scaling;
pub mod scheduler;

pub use aggregator::{
    AggregationResult, Aggregator, ConflictPolicy, LayerOutcome, ValidationReport, Validator,
};
pub use backend::{
    BackendHint, ExecutionBackend, ExecutionOutcome, Executor, FailureCategory, LocalBackend,
    OutcomeStatus,
};
pub use dispatcher::{AgentDispatcher, AgentEvent, AgentExecution, AgentId, DispatcherConfig};
pub use isolation::{ContextId, IsolationConfig, IsolationContext, IsolationManager};
pub use orchestrator::{Orchestrator, RunStatus, Submission, TaskCondition, TaskProgress};
pub use remote::{RemoteBackend, RemoteConfig};
pub use scaling::{ScalingConfig, ScalingDecision, ScalingPolicy};
pub use scheduler::{RunReport, Scheduler, SchedulerEvent};
