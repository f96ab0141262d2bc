//! Layer scheduler.
//!
//! The scheduler is the only owner of a run's DAG. It walks the layers in
//! order, hands each layer's ready tasks to the dispatcher, applies agent
//! events from the result channel, aggregates the layer and only then moves
//! on. Every mutation is persisted and published as a status snapshot.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::core::{RunId, RunState, StatusCounts, TaskDAG, TaskId, TaskStatus};
use crate::orchestration::aggregator::{AggregationResult, Aggregator, LayerOutcome};
use crate::orchestration::backend::{BackendHint, OutcomeStatus};
use crate::orchestration::dispatcher::{AgentDispatcher, AgentEvent, AgentExecution, AgentId};
use crate::state::{ManifestStore, RunManifest};
use crate::util;
use crate::Result;

/// Error recorded on tasks stopped by cancellation.
pub const CANCELLED_ERROR: &str = "cancelled";

/// Error recorded on tasks found mid-flight when a run is resumed.
pub const INTERRUPTED_ERROR: &str = "interrupted";

/// Events emitted by the scheduler for run lifecycle changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum SchedulerEvent {
    LayerStarted {
        layer: usize,
        tasks: Vec<TaskId>,
    },
    TaskStarted {
        task_id: TaskId,
        agent_id: AgentId,
        backend: BackendHint,
    },
    TaskSucceeded {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskTimedOut {
        task_id: TaskId,
    },
    LayerFinished {
        layer: usize,
        outcome: LayerOutcome,
    },
    /// A layer-fatal outcome stopped the run.
    RunHalted {
        layer: usize,
        reason: String,
    },
    RunFinished {
        state: RunState,
    },
}

/// Final report of a scheduler pass over a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub state: RunState,
    pub counts: StatusCounts,
    /// All layer results folded together.
    pub aggregation: AggregationResult,
}

/// Drives one run through its layers.
pub struct Scheduler {
    dag: TaskDAG,
    manifest: RunManifest,
    dispatcher: AgentDispatcher,
    aggregator: Arc<Aggregator>,
    store: Option<ManifestStore>,
    status_tx: watch::Sender<RunManifest>,
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Create a scheduler for a stored run. Returns the status receiver.
    ///
    /// Tasks the manifest shows as ready or running were abandoned by an
    /// earlier scheduler and are failed with [`INTERRUPTED_ERROR`].
    pub fn new(
        mut manifest: RunManifest,
        dispatcher: AgentDispatcher,
        aggregator: Arc<Aggregator>,
        store: Option<ManifestStore>,
    ) -> Result<(Self, watch::Receiver<RunManifest>)> {
        let stranded = manifest.interrupt_stranded(INTERRUPTED_ERROR);
        if !stranded.is_empty() {
            tracing::warn!(
                run = %manifest.run_id.short(),
                tasks = ?stranded,
                "failing tasks interrupted mid-flight"
            );
        }
        let dag = manifest.to_dag()?;
        let (status_tx, status_rx) = watch::channel(manifest.clone());
        Ok((
            Self {
                dag,
                manifest,
                dispatcher,
                aggregator,
                store,
                status_tx,
                event_tx: None,
                cancel: CancellationToken::new(),
            },
            status_rx,
        ))
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> RunId {
        self.manifest.run_id
    }

    pub fn dag(&self) -> &TaskDAG {
        &self.dag
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Sync the manifest, store it and publish it.
    async fn persist(&mut self) {
        self.manifest.sync_dag(&self.dag);
        let run_id = self.manifest.run_id;
        self.manifest.retained_contexts = self
            .dispatcher
            .isolation()
            .retained()
            .into_iter()
            .filter(|ctx| ctx.run_id == run_id)
            .collect();
        if let Some(store) = &self.store {
            let store = store.clone();
            let snapshot = self.manifest.clone();
            if let Err(e) = util::blocking(move || store.save(&snapshot)).await {
                tracing::error!(run = %run_id.short(), error = %e, "failed to persist manifest");
            }
        }
        self.status_tx.send_replace(self.manifest.clone());
    }

    fn set_status(&mut self, task_id: &TaskId, status: TaskStatus) {
        if let Err(e) = self.dag.set_status(task_id, status) {
            tracing::error!(task = %task_id, error = %e, "status update for unknown task");
        }
    }

    /// Apply one event from the result channel.
    fn apply(&mut self, event: AgentEvent) -> Option<AgentExecution> {
        match event {
            AgentEvent::Started {
                agent_id,
                task_id,
                backend,
                context,
            } => {
                self.set_status(&task_id, TaskStatus::Running);
                tracing::debug!(
                    task = %task_id,
                    agent = %agent_id.short(),
                    %backend,
                    namespace = %context.namespace.display(),
                    "task started"
                );
                self.emit(SchedulerEvent::TaskStarted {
                    task_id,
                    agent_id,
                    backend,
                });
                None
            }
            AgentEvent::Finished(execution) => {
                let task_id = execution.task_id.clone();
                match execution.status {
                    OutcomeStatus::Succeeded => {
                        self.set_status(&task_id, TaskStatus::Succeeded);
                        self.emit(SchedulerEvent::TaskSucceeded { task_id });
                    }
                    OutcomeStatus::TimedOut => {
                        self.set_status(&task_id, TaskStatus::TimedOut);
                        self.emit(SchedulerEvent::TaskTimedOut { task_id });
                    }
                    OutcomeStatus::Failed | OutcomeStatus::Cancelled => {
                        let error = if execution.status == OutcomeStatus::Cancelled {
                            CANCELLED_ERROR.to_string()
                        } else {
                            execution.error_message()
                        };
                        self.set_status(
                            &task_id,
                            TaskStatus::Failed {
                                error: error.clone(),
                            },
                        );
                        self.emit(SchedulerEvent::TaskFailed { task_id, error });
                    }
                }
                self.manifest.record_execution(execution.clone());
                Some(execution)
            }
        }
    }

    /// Dispatch the ready tasks of `layer` and wait until all report back.
    async fn run_layer(&mut self, layer: usize) -> Vec<AgentExecution> {
        let ready: Vec<_> = self
            .dag
            .ready_in_layer(layer)
            .into_iter()
            .cloned()
            .collect();
        let ids: Vec<TaskId> = ready.iter().map(|t| t.id.clone()).collect();
        tracing::info!(run = %self.run_id().short(), layer, tasks = ?ids, "layer started");
        self.emit(SchedulerEvent::LayerStarted { layer, tasks: ids });
        if ready.is_empty() {
            return Vec::new();
        }

        for task in &ready {
            self.set_status(&task.id, TaskStatus::Ready);
        }
        self.persist().await;

        let mut rx = self
            .dispatcher
            .spawn_layer(self.run_id(), ready, self.cancel.child_token());
        let mut executions = Vec::new();
        while let Some(event) = rx.recv().await {
            if let Some(execution) = self.apply(event) {
                executions.push(execution);
            }
            self.persist().await;
        }
        executions
    }

    /// Release merged contexts; keep everything else for inspection.
    fn settle_contexts(&self, executions: &[AgentExecution], merged: bool) {
        let isolation = self.dispatcher.isolation();
        for execution in executions.iter().filter(|e| e.succeeded()) {
            let Some(ctx) = &execution.context else {
                continue;
            };
            if merged {
                if let Err(e) = isolation.release(ctx) {
                    tracing::warn!(task = %execution.task_id, error = %e, "failed to release context");
                }
            } else {
                isolation.retain(ctx);
            }
        }
    }

    /// Run every remaining layer. Consumes the scheduler.
    pub async fn run(mut self) -> Result<RunReport> {
        let run_id = self.run_id();
        self.manifest.state = RunState::Running;
        self.persist().await;

        let done_layers = self.manifest.layer_results.len();

        let layer_count = self.dag.layers().len();
        let mut state = RunState::Completed;
        for layer in 0..layer_count {
            if self.cancel.is_cancelled() {
                state = RunState::Cancelled;
                break;
            }
            self.manifest.current_layer = Some(layer);
            let executions = self.run_layer(layer).await;
            if executions.is_empty() && layer < done_layers {
                // Already aggregated on an earlier pass.
                continue;
            }

            // A retried layer merges with the earlier successes of its other tasks.
            let latest: Vec<AgentExecution> = self.dag.layers()[layer]
                .iter()
                .filter_map(|id| self.manifest.last_execution(id).cloned())
                .collect();
            let result = self.aggregator.aggregate(layer, &latest).await;
            let merged = result.outcome.is_merged();
            self.settle_contexts(&latest, merged);
            self.emit(SchedulerEvent::LayerFinished {
                layer,
                outcome: result.outcome.clone(),
            });
            let fatal = result.outcome.to_error(layer);
            match self.manifest.layer_results.get_mut(layer) {
                Some(slot) => *slot = result,
                None => self.manifest.layer_results.push(result),
            }

            if self.cancel.is_cancelled() {
                state = RunState::Cancelled;
                break;
            }
            if let Some(err) = fatal {
                let reason = err.to_string();
                tracing::error!(run = %run_id.short(), layer, %reason, "run halted");
                self.emit(SchedulerEvent::RunHalted {
                    layer,
                    reason: reason.clone(),
                });
                state = RunState::Halted { layer, reason };
                break;
            }
            self.persist().await;
        }

        // Every dispatched task reports back, so nothing should be left
        // in flight; if something is, it must not read as still running.
        let stranded: Vec<TaskId> = self
            .dag
            .tasks()
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Ready | TaskStatus::Running))
            .map(|t| t.id.clone())
            .collect();
        for id in &stranded {
            tracing::warn!(task = %id, "task left in flight at end of run");
            self.set_status(
                id,
                TaskStatus::Failed {
                    error: INTERRUPTED_ERROR.to_string(),
                },
            );
        }

        // Each layer slot counts once, in layer order.
        let mut aggregation = AggregationResult::empty(0);
        for result in &self.manifest.layer_results {
            aggregation.absorb(result);
        }

        self.manifest.state = state.clone();
        self.persist().await;
        let counts = self.dag.status_counts();
        tracing::info!(
            run = %run_id.short(),
            %state,
            succeeded = counts.succeeded,
            failed = counts.failed,
            timed_out = counts.timed_out,
            pending = counts.pending,
            "run finished"
        );
        self.emit(SchedulerEvent::RunFinished {
            state: state.clone(),
        });
        Ok(RunReport {
            run_id,
            state,
            counts,
            aggregation,
        })
    }
}
