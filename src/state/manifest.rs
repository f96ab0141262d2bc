//! Run manifests persisted as JSON.
//!
//! One file per run holds the full task records, the layering, every agent
//! execution and the per-layer aggregation results. Status queries can be
//! answered from it after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::core::{BlockReason, RunId, RunState, Task, TaskDAG, TaskId, TaskStatus};
use crate::orchestration::aggregator::AggregationResult;
use crate::orchestration::dispatcher::AgentExecution;
use crate::orchestration::isolation::IsolationContext;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Layer currently being processed, if the run has started.
    pub current_layer: Option<usize>,
    /// Every task, sorted by id.
    pub tasks: Vec<Task>,
    pub layers: Vec<Vec<TaskId>>,
    #[serde(default)]
    pub blocked: BTreeMap<TaskId, BlockReason>,
    #[serde(default)]
    pub cycles: Vec<Vec<TaskId>>,
    #[serde(default)]
    pub executions: Vec<AgentExecution>,
    #[serde(default)]
    pub layer_results: Vec<AggregationResult>,
    #[serde(default)]
    pub retained_contexts: Vec<IsolationContext>,
}

impl RunManifest {
    pub fn new(run_id: RunId, dag: &TaskDAG) -> Self {
        let now = Utc::now();
        let mut manifest = Self {
            run_id,
            state: RunState::Pending,
            created_at: now,
            updated_at: now,
            current_layer: None,
            tasks: Vec::new(),
            layers: Vec::new(),
            blocked: BTreeMap::new(),
            cycles: Vec::new(),
            executions: Vec::new(),
            layer_results: Vec::new(),
            retained_contexts: Vec::new(),
        };
        manifest.sync_dag(dag);
        manifest
    }

    /// Refresh the task and layer view from the DAG.
    pub fn sync_dag(&mut self, dag: &TaskDAG) {
        let mut tasks: Vec<Task> = dag.tasks().into_iter().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        self.tasks = tasks;
        self.layers = dag.layers().to_vec();
        self.blocked = dag.blocked().clone();
        self.cycles = dag.cycles().to_vec();
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Rebuild the DAG, statuses included.
    pub fn to_dag(&self) -> Result<TaskDAG> {
        TaskDAG::build(self.tasks.iter().cloned())
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    /// The most recent execution of a task.
    pub fn last_execution(&self, id: &TaskId) -> Option<&AgentExecution> {
        self.executions.iter().rev().find(|e| &e.task_id == id)
    }

    /// Fail every task caught mid-flight by a process that is no longer
    /// driving the run. Returns their ids.
    pub fn interrupt_stranded(&mut self, error: &str) -> Vec<TaskId> {
        let mut stranded = Vec::new();
        for task in &mut self.tasks {
            if matches!(task.status, TaskStatus::Ready | TaskStatus::Running) {
                task.fail(error);
                stranded.push(task.id.clone());
            }
        }
        if !stranded.is_empty() {
            self.touch();
        }
        stranded
    }

    /// Replace or append the execution for the same agent.
    pub fn record_execution(&mut self, execution: AgentExecution) {
        match self
            .executions
            .iter_mut()
            .find(|e| e.agent_id == execution.agent_id)
        {
            Some(existing) => *existing = execution,
            None => self.executions.push(execution),
        }
        self.touch();
    }
}

/// Stores manifests under a directory, one `<run-id>.json` per run.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.state_root()?)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    /// Write the manifest atomically: temp file first, then rename.
    pub fn save(&self, manifest: &RunManifest) -> Result<()> {
        let path = self.path(&manifest.run_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(manifest)?)?;
        fs::rename(&tmp, &path)?;
        tracing::trace!(run = %manifest.run_id.short(), path = %path.display(), "manifest saved");
        Ok(())
    }

    /// # Errors
    /// Returns [`Error::RunNotFound`] if no manifest exists for the run.
    pub fn load(&self, run_id: &RunId) -> Result<RunManifest> {
        let path = self.path(run_id);
        if !path.exists() {
            return Err(Error::RunNotFound(*run_id));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn exists(&self, run_id: &RunId) -> bool {
        self.path(run_id).exists()
    }

    /// Every stored run id, sorted.
    pub fn list(&self) -> Result<Vec<RunId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<RunId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Returns false if there was nothing to remove.
    pub fn remove(&self, run_id: &RunId) -> Result<bool> {
        let path = self.path(run_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }
}
