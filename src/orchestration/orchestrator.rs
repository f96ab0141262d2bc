//! Submission and status interfaces.
//!
//! The [`Orchestrator`] wires the components together: it accepts task
//! submissions, starts schedulers for runs, answers status queries from
//! live snapshots or persisted manifests and carries out explicit caller
//! decisions such as retrying a task or cleaning up retained contexts.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::{
    BlockReason, RunId, RunState, StatusCounts, Task, TaskDAG, TaskId, TaskSpec, TaskStatus,
};
use crate::orchestration::aggregator::{Aggregator, Validator};
use crate::orchestration::backend::{BackendHint, ExecutionBackend, Executor, LocalBackend};
use crate::orchestration::dispatcher::{AgentDispatcher, DispatcherConfig};
use crate::orchestration::isolation::{IsolationConfig, IsolationContext, IsolationManager};
use crate::orchestration::remote::RemoteBackend;
use crate::orchestration::scaling::ScalingPolicy;
use crate::orchestration::scheduler::{
    RunReport, Scheduler, SchedulerEvent, CANCELLED_ERROR, INTERRUPTED_ERROR,
};
use crate::state::{ManifestStore, RunManifest};
use crate::util;
use crate::{Error, Result};

/// Upper bound on removing a run's retained contexts.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of a task submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Tracking identifier for the run.
    pub run_id: RunId,
    /// Cyclic task groups excluded from the run.
    pub cycles: Vec<Vec<TaskId>>,
    /// Every task that will not be dispatched, and why.
    pub blocked: BTreeMap<TaskId, BlockReason>,
}

/// What a task is doing, or why it is not doing anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "condition")]
pub enum TaskCondition {
    WaitingOnDependency { dependencies: Vec<TaskId> },
    Ready,
    Running,
    Succeeded,
    /// Failed; will not proceed without an explicit retry.
    Failed { error: String },
    TimedOut,
    BlockedByFailedDependency { dependency: TaskId },
    BlockedByValidation { layer: usize },
    BlockedByCycle,
    MissingDependency { dependency: TaskId },
    /// Downstream of a task whose dependency is unknown.
    BlockedByMissingDependency { dependency: TaskId },
    Cancelled,
}

impl std::fmt::Display for TaskCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskCondition::WaitingOnDependency { dependencies } => {
                let ids: Vec<&str> = dependencies.iter().map(TaskId::as_str).collect();
                write!(f, "waiting on dependency {}", ids.join(", "))
            }
            TaskCondition::Ready => write!(f, "ready"),
            TaskCondition::Running => write!(f, "running"),
            TaskCondition::Succeeded => write!(f, "succeeded"),
            TaskCondition::Failed { error } => write!(f, "failed, will not proceed: {}", error),
            TaskCondition::TimedOut => write!(f, "timed out, will not proceed"),
            TaskCondition::BlockedByFailedDependency { dependency } => {
                write!(f, "blocked by failed dependency {}", dependency)
            }
            TaskCondition::BlockedByValidation { layer } => {
                write!(f, "blocked by validation of layer {}", layer)
            }
            TaskCondition::BlockedByCycle => write!(f, "blocked by dependency cycle"),
            TaskCondition::MissingDependency { dependency } => {
                write!(f, "unknown dependency {}", dependency)
            }
            TaskCondition::BlockedByMissingDependency { dependency } => {
                write!(f, "blocked by unknown dependency {} upstream", dependency)
            }
            TaskCondition::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub layer: Option<usize>,
    pub status: TaskStatus,
    pub condition: TaskCondition,
    pub backend: Option<BackendHint>,
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: RunId,
    pub state: RunState,
    pub current_layer: Option<usize>,
    pub layer_count: usize,
    pub counts: StatusCounts,
    /// Terminal tasks as a share of all tasks, 0-100.
    pub progress: f64,
    /// Per-task progress, sorted by id.
    pub tasks: Vec<TaskProgress>,
}

impl RunStatus {
    pub fn from_manifest(manifest: &RunManifest) -> Self {
        let counts = StatusCounts::tally(&manifest.tasks);
        let progress = counts.progress();
        let layer_of: HashMap<&TaskId, usize> = manifest
            .layers
            .iter()
            .enumerate()
            .flat_map(|(i, ids)| ids.iter().map(move |id| (id, i)))
            .collect();

        let tasks = manifest
            .tasks
            .iter()
            .map(|task| TaskProgress {
                task_id: task.id.clone(),
                layer: layer_of.get(&task.id).copied(),
                status: task.status.clone(),
                condition: condition_of(manifest, task, &layer_of),
                backend: manifest.last_execution(&task.id).map(|e| e.backend),
            })
            .collect();

        Self {
            run_id: manifest.run_id,
            state: manifest.state.clone(),
            current_layer: manifest.current_layer,
            layer_count: manifest.layers.len(),
            counts,
            progress,
            tasks,
        }
    }

    pub fn task(&self, id: &str) -> Option<&TaskProgress> {
        self.tasks.iter().find(|t| t.task_id.as_str() == id)
    }
}

/// First failed task found upstream of `task`, following pending dependencies.
fn failed_upstream(manifest: &RunManifest, task: &Task) -> Option<TaskId> {
    let mut stack: Vec<&TaskId> = task.dependencies.iter().collect();
    let mut seen = std::collections::HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let Some(dep) = manifest.task(id) else {
            continue;
        };
        if dep.blocks_dependents() {
            return Some(dep.id.clone());
        }
        if dep.can_start() {
            stack.extend(dep.dependencies.iter());
        }
    }
    None
}

/// Follow a `BlockedBy` chain to the cycle or missing dependency behind it.
fn root_block<'a>(manifest: &'a RunManifest, reason: &'a BlockReason) -> Option<&'a BlockReason> {
    let mut current = reason;
    let mut seen = std::collections::HashSet::new();
    while let BlockReason::BlockedBy { dependency } = current {
        if !seen.insert(dependency) {
            return None;
        }
        current = manifest.blocked.get(dependency)?;
    }
    Some(current)
}

fn condition_of(
    manifest: &RunManifest,
    task: &Task,
    layer_of: &HashMap<&TaskId, usize>,
) -> TaskCondition {
    match &task.status {
        TaskStatus::Running => return TaskCondition::Running,
        TaskStatus::Succeeded => return TaskCondition::Succeeded,
        TaskStatus::TimedOut => return TaskCondition::TimedOut,
        TaskStatus::Failed { error } if error == CANCELLED_ERROR => {
            return TaskCondition::Cancelled
        }
        TaskStatus::Failed { error } => {
            return TaskCondition::Failed {
                error: error.clone(),
            }
        }
        TaskStatus::Pending | TaskStatus::Ready => {}
    }

    match manifest.blocked.get(&task.id) {
        Some(BlockReason::MissingDependency { dependency }) => {
            return TaskCondition::MissingDependency {
                dependency: dependency.clone(),
            }
        }
        Some(BlockReason::Cycle) => return TaskCondition::BlockedByCycle,
        Some(reason @ BlockReason::BlockedBy { .. }) => {
            return match root_block(manifest, reason) {
                Some(BlockReason::MissingDependency { dependency }) => {
                    TaskCondition::BlockedByMissingDependency {
                        dependency: dependency.clone(),
                    }
                }
                _ => TaskCondition::BlockedByCycle,
            }
        }
        None => {}
    }
    if let Some(dependency) = failed_upstream(manifest, task) {
        return TaskCondition::BlockedByFailedDependency { dependency };
    }
    if let RunState::Halted { layer, .. } = manifest.state {
        if layer_of.get(&task.id).is_some_and(|l| *l > layer) {
            return TaskCondition::BlockedByValidation { layer };
        }
    }
    if manifest.state == RunState::Cancelled {
        return TaskCondition::Cancelled;
    }

    let waiting: Vec<TaskId> = task
        .dependencies
        .iter()
        .filter(|id| {
            manifest
                .task(id)
                .map_or(true, |dep| dep.status != TaskStatus::Succeeded)
        })
        .cloned()
        .collect();
    if waiting.is_empty() {
        TaskCondition::Ready
    } else {
        TaskCondition::WaitingOnDependency {
            dependencies: waiting,
        }
    }
}

struct RunHandle {
    status: watch::Receiver<RunManifest>,
    cancel: CancellationToken,
    active: bool,
}

/// Front door of the orchestrator.
pub struct Orchestrator {
    dispatcher: AgentDispatcher,
    aggregator: Arc<Aggregator>,
    store: ManifestStore,
    runs: RwLock<HashMap<RunId, RunHandle>>,
}

impl Orchestrator {
    /// Build every component from configuration.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let isolation = Arc::new(IsolationManager::new(IsolationConfig::from_config(config)?)?);
        let local: Arc<dyn ExecutionBackend> = Arc::new(LocalBackend::new(config.cancel_grace()));
        let mut executor = Executor::new(local);
        if let Some(remote) = &config.remote {
            executor = executor.with_remote(Arc::new(RemoteBackend::new(remote.clone())?));
        }
        let scaling = Arc::new(ScalingPolicy::new(
            config.scaling.clone(),
            executor.remote_available(),
        ));
        let dispatcher = AgentDispatcher::new(
            DispatcherConfig::from_config(config),
            isolation,
            executor,
            scaling,
        );
        Ok(Self::from_parts(
            dispatcher,
            Aggregator::from_config(config),
            ManifestStore::from_config(config)?,
        ))
    }

    /// Assemble from prebuilt components.
    pub fn from_parts(dispatcher: AgentDispatcher, aggregator: Aggregator, store: ManifestStore) -> Self {
        Self {
            dispatcher,
            aggregator: Arc::new(aggregator),
            store,
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Attach the external validation collaborator.
    pub fn with_validator(self, validator: Arc<dyn Validator>) -> Self {
        let aggregator = Aggregator::new(self.aggregator.policy(), self.aggregator.min_confidence())
            .with_validator(validator);
        Self {
            aggregator: Arc::new(aggregator),
            ..self
        }
    }

    pub fn store(&self) -> &ManifestStore {
        &self.store
    }

    pub fn isolation(&self) -> &Arc<IsolationManager> {
        self.dispatcher.isolation()
    }

    /// Accept a task set and create a run for it.
    ///
    /// Cyclic tasks and everything depending on them are reported and left
    /// out; the rest of the run proceeds.
    ///
    /// # Errors
    /// - [`Error::Validation`] for an empty submission or a bad complexity
    /// - [`Error::DuplicateTask`] if two records share an id
    /// - [`Error::CycleDetected`] if no task could be scheduled because of cycles
    pub async fn submit(&self, specs: Vec<TaskSpec>) -> Result<Submission> {
        if specs.is_empty() {
            return Err(Error::Validation("submission contains no tasks".to_string()));
        }
        if let Some(spec) = specs
            .iter()
            .find(|s| !s.complexity.is_finite() || s.complexity < 0.0)
        {
            return Err(Error::Validation(format!(
                "task {} has invalid complexity {}",
                spec.id, spec.complexity
            )));
        }

        let dag = TaskDAG::build(specs.into_iter().map(Task::from))?;
        if dag.layers().iter().all(Vec::is_empty) {
            if let Some(err) = dag.cycle_error() {
                return Err(err);
            }
        }

        let run_id = RunId::new();
        if !dag.cycles().is_empty() {
            tracing::warn!(run = %run_id.short(), cycles = ?dag.cycles(), "submission contains cycles");
        }
        let manifest = RunManifest::new(run_id, &dag);
        let store = self.store.clone();
        let snapshot = manifest.clone();
        util::blocking(move || store.save(&snapshot)).await?;
        tracing::info!(
            run = %run_id.short(),
            tasks = dag.task_count(),
            layers = dag.layers().len(),
            blocked = dag.blocked().len(),
            "run submitted"
        );

        Ok(Submission {
            run_id,
            cycles: dag.cycles().to_vec(),
            blocked: dag.blocked().clone(),
        })
    }

    async fn load(&self, run_id: &RunId) -> Result<RunManifest> {
        let store = self.store.clone();
        let id = *run_id;
        util::blocking(move || store.load(&id)).await
    }

    async fn save(&self, manifest: RunManifest) -> Result<()> {
        let store = self.store.clone();
        util::blocking(move || store.save(&manifest)).await
    }

    async fn is_active(&self, run_id: &RunId) -> bool {
        self.runs
            .read()
            .await
            .get(run_id)
            .is_some_and(|handle| handle.active)
    }

    /// Execute a run until it completes, halts or is cancelled.
    pub async fn run(&self, run_id: RunId) -> Result<RunReport> {
        self.run_inner(run_id, None).await
    }

    /// Like [`Orchestrator::run`], forwarding scheduler events.
    pub async fn run_with_events(
        &self,
        run_id: RunId,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Result<RunReport> {
        self.run_inner(run_id, Some(events)).await
    }

    async fn run_inner(
        &self,
        run_id: RunId,
        events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    ) -> Result<RunReport> {
        let manifest = self.load(&run_id).await?;
        match &manifest.state {
            RunState::Halted { layer, reason } => {
                // Report the halt with the kind of error that caused it.
                let stored = manifest
                    .layer_results
                    .get(*layer)
                    .and_then(|result| result.outcome.to_error(*layer));
                return Err(stored.unwrap_or_else(|| Error::ValidationFailed {
                    layer: *layer,
                    reason: reason.clone(),
                }));
            }
            RunState::Cancelled => {
                return Err(Error::Validation(format!("run {} was cancelled", run_id)))
            }
            _ => {}
        }

        let cancel = CancellationToken::new();
        let (scheduler, status) = Scheduler::new(
            manifest,
            self.dispatcher.clone(),
            self.aggregator.clone(),
            Some(self.store.clone()),
        )?;
        {
            let mut runs = self.runs.write().await;
            if runs.get(&run_id).is_some_and(|h| h.active) {
                return Err(Error::Validation(format!("run {} is already active", run_id)));
            }
            runs.insert(
                run_id,
                RunHandle {
                    status,
                    cancel: cancel.clone(),
                    active: true,
                },
            );
        }

        let mut scheduler = scheduler.with_cancel(cancel);
        if let Some(tx) = events {
            scheduler = scheduler.with_events(tx);
        }
        let report = scheduler.run().await;

        if let Some(handle) = self.runs.write().await.get_mut(&run_id) {
            handle.active = false;
        }
        report
    }

    /// Cancel a run. In-flight tasks are stopped; finished ones stay finished.
    pub async fn cancel(&self, run_id: &RunId) -> Result<()> {
        if let Some(handle) = self.runs.read().await.get(run_id) {
            if handle.active {
                tracing::info!(run = %run_id.short(), "cancelling run");
                handle.cancel.cancel();
                return Ok(());
            }
        }
        let mut manifest = self.load(run_id).await?;
        if !manifest.state.is_terminal() {
            manifest.state = RunState::Cancelled;
            manifest.touch();
            self.save(manifest).await?;
        }
        Ok(())
    }

    /// Current layer, per-task status and progress for a run.
    ///
    /// Served from the live snapshot while the run is known to this
    /// process, otherwise from the persisted manifest.
    pub async fn status(&self, run_id: &RunId) -> Result<RunStatus> {
        if let Some(handle) = self.runs.read().await.get(run_id) {
            let manifest = handle.status.borrow();
            return Ok(RunStatus::from_manifest(&manifest));
        }
        let mut manifest = self.load(run_id).await?;
        if manifest.state == RunState::Running {
            // No scheduler here owns it: the process that did has gone.
            manifest.interrupt_stranded(INTERRUPTED_ERROR);
            manifest.state = RunState::Pending;
        }
        Ok(RunStatus::from_manifest(&manifest))
    }

    /// Wait until a running run publishes a new snapshot, or `timeout`.
    pub async fn wait_for_change(&self, run_id: &RunId, timeout: Duration) -> Result<RunStatus> {
        let live = self
            .runs
            .read()
            .await
            .get(run_id)
            .map(|handle| handle.status.clone());
        let Some(mut rx) = live else {
            return self.status(run_id).await;
        };
        let _ = tokio::time::timeout(timeout, rx.changed()).await;
        let manifest = rx.borrow().clone();
        Ok(RunStatus::from_manifest(&manifest))
    }

    /// Return a failed or timed-out task to pending for another attempt.
    ///
    /// On a halted run any finished task of the halted layer may be reset;
    /// that acknowledges the halt and lets the run be started again.
    pub async fn reset_task(&self, run_id: &RunId, task_id: &TaskId) -> Result<()> {
        if self.is_active(run_id).await {
            return Err(Error::Validation(format!(
                "run {} is active; cancel it before resetting tasks",
                run_id
            )));
        }
        let mut manifest = self.load(run_id).await?;
        let mut dag = manifest.to_dag()?;
        let task = dag
            .task(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;

        let halted_layer = match &manifest.state {
            RunState::Halted { layer, .. } => Some(*layer),
            _ => None,
        };
        let resettable = task.blocks_dependents()
            || (task.is_finished() && halted_layer.is_some() && dag.layer_of(task_id) == halted_layer);
        if !resettable {
            return Err(Error::InvalidTransition {
                task_id: task_id.clone(),
                from: task.status.name().to_string(),
            });
        }

        dag.set_status(task_id, TaskStatus::Pending)?;
        let stale: Vec<IsolationContext> = self
            .isolation()
            .retained()
            .into_iter()
            .filter(|ctx| ctx.run_id == *run_id && &ctx.task_id == task_id)
            .collect();
        let isolation = self.isolation().clone();
        util::blocking(move || stale.iter().try_for_each(|ctx| isolation.release(ctx))).await?;
        manifest
            .retained_contexts
            .retain(|ctx| &ctx.task_id != task_id);
        if let Some(layer) = halted_layer {
            manifest.layer_results.truncate(layer);
            manifest.state = RunState::Pending;
        } else if manifest.state.is_terminal() {
            manifest.state = RunState::Pending;
        }
        manifest.sync_dag(&dag);
        tracing::info!(run = %run_id.short(), task = %task_id, "task reset for retry");
        self.save(manifest.clone()).await?;
        self.runs.write().await.remove(run_id);
        Ok(())
    }

    /// Remove every retained context of a run. Returns how many were removed.
    pub async fn cleanup(&self, run_id: &RunId) -> Result<usize> {
        let mut manifest = self.load(run_id).await?;
        for ctx in manifest.retained_contexts.drain(..) {
            self.isolation().adopt_retained(ctx);
        }
        let isolation = self.isolation().clone();
        let id = *run_id;
        let removed =
            util::blocking_with_timeout(CLEANUP_TIMEOUT, move || isolation.cleanup_retained(Some(&id)))
                .await?;
        manifest.touch();
        self.save(manifest).await?;
        tracing::info!(run = %run_id.short(), removed, "retained contexts cleaned up");
        Ok(removed)
    }

    /// Ids of every persisted run.
    pub fn runs(&self) -> Result<Vec<RunId>> {
        self.store.list()
    }
}
