//! Agent dispatcher.
//!
//! Launches one agent per ready task: allocates an isolation context, asks
//! the scaling policy for a backend, runs the payload and reports the
//! result over a channel. Agents never touch the DAG; the scheduler applies
//! their events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::core::{RunId, Task, TaskId};
use crate::orchestration::backend::{
    BackendHint, ExecutionFailure, ExecutionOutcome, Executor, FailureCategory, OutcomeStatus,
};
use crate::orchestration::isolation::{IsolationContext, IsolationManager};
use crate::orchestration::scaling::{LoadSnapshot, ScalingPolicy};
use crate::{util, Error};

/// Unique identifier for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One task bound to a context and a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentExecution {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    /// None when the agent was cancelled before a context was allocated.
    pub context: Option<IsolationContext>,
    pub backend: BackendHint,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: OutcomeStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<ExecutionFailure>,
}

impl AgentExecution {
    fn finish(
        agent_id: AgentId,
        task_id: TaskId,
        context: Option<IsolationContext>,
        started_at: DateTime<Utc>,
        outcome: ExecutionOutcome,
    ) -> Self {
        Self {
            agent_id,
            task_id,
            context,
            backend: outcome.backend,
            started_at,
            ended_at: Some(Utc::now()),
            status: outcome.status,
            exit_code: outcome.exit_code,
            output: outcome.output,
            error: outcome.error,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }

    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| format!("{:?}", self.status))
    }

    /// The task-level error for an unsuccessful execution.
    ///
    /// `timeout` is the limit the execution ran under.
    pub fn to_error(&self, timeout: Duration) -> Option<Error> {
        match self.status {
            OutcomeStatus::Succeeded => None,
            OutcomeStatus::TimedOut => Some(Error::ExecutionTimeout {
                task_id: self.task_id.clone(),
                timeout,
            }),
            OutcomeStatus::Failed | OutcomeStatus::Cancelled => Some(Error::ExecutionError {
                task_id: self.task_id.clone(),
                message: self.error_message(),
            }),
        }
    }
}

/// Messages on the result channel.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The agent holds a context and is about to execute.
    Started {
        agent_id: AgentId,
        task_id: TaskId,
        backend: BackendHint,
        context: IsolationContext,
    },
    /// The agent reached a terminal status.
    Finished(AgentExecution),
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent_agents: usize,
    pub task_timeout: Duration,
    /// Wait between allocation attempts under backpressure.
    pub allocation_backoff: Duration,
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_agents: config.max_concurrent_agents,
            task_timeout: config.task_timeout(),
            allocation_backoff: config.allocation_backoff(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Launches and tracks agents for ready tasks.
#[derive(Clone)]
pub struct AgentDispatcher {
    config: DispatcherConfig,
    isolation: Arc<IsolationManager>,
    executor: Executor,
    scaling: Arc<ScalingPolicy>,
    permits: Arc<Semaphore>,
    local_running: Arc<AtomicUsize>,
    remote_running: Arc<AtomicUsize>,
}

impl AgentDispatcher {
    pub fn new(
        config: DispatcherConfig,
        isolation: Arc<IsolationManager>,
        executor: Executor,
        scaling: Arc<ScalingPolicy>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_agents.max(1)));
        Self {
            config,
            isolation,
            executor,
            scaling,
            permits,
            local_running: Arc::new(AtomicUsize::new(0)),
            remote_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn isolation(&self) -> &Arc<IsolationManager> {
        &self.isolation
    }

    pub fn scaling(&self) -> &Arc<ScalingPolicy> {
        &self.scaling
    }

    pub fn load(&self) -> LoadSnapshot {
        LoadSnapshot {
            local_running: self.local_running.load(Ordering::SeqCst),
            remote_running: self.remote_running.load(Ordering::SeqCst),
        }
    }

    fn counter(&self, hint: BackendHint) -> &AtomicUsize {
        match hint {
            BackendHint::Local => &self.local_running,
            BackendHint::Remote => &self.remote_running,
        }
    }

    /// Launch an agent per task and return the result channel.
    ///
    /// The channel closes once every agent has sent `Finished`.
    pub fn spawn_layer(
        &self,
        run_id: RunId,
        tasks: Vec<Task>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(tasks.len().max(1) * 2);
        tracing::info!(run = %run_id.short(), agents = tasks.len(), "dispatching layer");
        for task in tasks {
            let dispatcher = self.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                dispatcher.run_agent(run_id, task, cancel, tx).await;
            });
        }
        rx
    }

    /// Dispatch a layer and wait for every agent, ordered by task id.
    pub async fn dispatch_layer(
        &self,
        run_id: RunId,
        tasks: Vec<Task>,
        cancel: CancellationToken,
    ) -> Vec<AgentExecution> {
        let mut rx = self.spawn_layer(run_id, tasks, cancel);
        let mut executions = Vec::new();
        while let Some(event) = rx.recv().await {
            if let AgentEvent::Finished(execution) = event {
                executions.push(execution);
            }
        }
        executions.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        executions
    }

    async fn run_agent(
        &self,
        run_id: RunId,
        task: Task,
        cancel: CancellationToken,
        tx: mpsc::Sender<AgentEvent>,
    ) {
        let agent_id = AgentId::new();
        let started_at = Utc::now();
        let abort = |outcome: ExecutionOutcome| {
            AgentEvent::Finished(AgentExecution::finish(
                agent_id,
                task.id.clone(),
                None,
                started_at,
                outcome,
            ))
        };

        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit,
            _ = cancel.cancelled() => {
                let _ = tx.send(abort(ExecutionOutcome::cancelled(BackendHint::Local, Duration::ZERO))).await;
                return;
            }
        };
        let Ok(_permit) = permit else {
            let _ = tx
                .send(abort(ExecutionOutcome::cancelled(BackendHint::Local, Duration::ZERO)))
                .await;
            return;
        };

        let context = match self.allocate(&run_id, &task.id, &cancel).await {
            Ok(context) => context,
            Err(outcome) => {
                let _ = tx.send(abort(outcome)).await;
                return;
            }
        };

        let decision = self.scaling.choose_backend(&task, &self.load());
        let hint = decision.hint;
        let _ = tx
            .send(AgentEvent::Started {
                agent_id,
                task_id: task.id.clone(),
                backend: hint,
                context: context.clone(),
            })
            .await;

        self.counter(hint).fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .executor
            .execute(&task, &context, hint, self.config.task_timeout, cancel)
            .await;
        self.counter(hint).fetch_sub(1, Ordering::SeqCst);

        if outcome.backend == BackendHint::Remote {
            self.scaling.record_remote_outcome(&outcome);
        }

        if outcome.is_success() {
            self.isolation.mark_idle(&context);
            tracing::debug!(task = %task.id, agent = %agent_id.short(), duration = ?outcome.duration, "agent succeeded");
        } else {
            self.isolation.retain(&context);
        }

        let execution =
            AgentExecution::finish(agent_id, task.id.clone(), Some(context), started_at, outcome);
        if let Some(err) = execution.to_error(self.config.task_timeout) {
            tracing::warn!(agent = %agent_id.short(), error = %err, "agent did not succeed");
        }
        let _ = tx.send(AgentEvent::Finished(execution)).await;
    }

    /// Allocate a context, retrying while the isolation manager pushes back.
    async fn allocate(
        &self,
        run_id: &RunId,
        task_id: &TaskId,
        cancel: &CancellationToken,
    ) -> std::result::Result<IsolationContext, ExecutionOutcome> {
        let mut attempts = 0u32;
        loop {
            let isolation = self.isolation.clone();
            let (run, task) = (*run_id, task_id.clone());
            match util::blocking(move || isolation.allocate(&run, &task)).await {
                Ok(context) => return Ok(context),
                Err(e) if e.is_backpressure() => {
                    attempts += 1;
                    if attempts == 1 || attempts % 50 == 0 {
                        tracing::warn!(task = %task_id, attempts, error = %e, "isolation backpressure, retrying");
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.allocation_backoff) => {}
                        _ = cancel.cancelled() => {
                            return Err(ExecutionOutcome::cancelled(BackendHint::Local, Duration::ZERO));
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(task = %task_id, error = %e, "isolation allocation failed");
                    return Err(ExecutionOutcome::failed(
                        BackendHint::Local,
                        ExecutionFailure::new(
                            FailureCategory::Spawn,
                            format!("isolation allocation failed: {}", e),
                        ),
                        Duration::ZERO,
                    ));
                }
            }
        }
    }
}

impl std::fmt::Debug for AgentDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDispatcher")
            .field("max_concurrent_agents", &self.config.max_concurrent_agents)
            .field("load", &self.load())
            .finish()
    }
}
