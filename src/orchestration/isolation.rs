//! Branch/isolation manager.
//!
//! Every task invocation runs inside its own [`IsolationContext`]: a branch
//! name plus a namespace directory that no other live context overlaps.
//! With a repository configured the namespace is a git worktree on the
//! branch; otherwise it is a plain directory.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use uuid::Uuid;

use crate::config::Config;
use crate::core::{RunId, TaskId};
use crate::git::GitOps;
use crate::{Error, Result};

/// Unique identifier for an isolation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An exclusive execution scope for one task invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationContext {
    pub id: ContextId,
    pub run_id: RunId,
    pub task_id: TaskId,
    /// Branch the task's work lives on.
    pub branch: String,
    /// Directory the task may write into. Nothing outside it.
    pub namespace: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Whether the namespace is a git worktree.
    pub worktree: bool,
}

impl IsolationContext {
    /// True if either namespace contains the other.
    pub fn overlaps(&self, other: &Path) -> bool {
        self.namespace.starts_with(other) || other.starts_with(&self.namespace)
    }
}

/// Lifecycle of a live context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    /// A task is executing inside the context.
    Active,
    /// Execution finished; waiting for its result to be merged.
    Idle,
    /// Kept after a failure or timeout for inspection.
    Retained,
}

/// Settings for the isolation manager.
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    /// Directory under which namespaces are created.
    pub root: PathBuf,
    pub branch_prefix: String,
    /// Maximum number of contexts in the Active state.
    pub max_active: usize,
    /// Repository to create worktrees from, if any.
    pub repository: Option<PathBuf>,
}

impl IsolationConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            branch_prefix: "dagrun".to_string(),
            max_active: 16,
            repository: None,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            root: config.workspace_root()?,
            branch_prefix: config.branch_prefix.clone(),
            max_active: config.max_active_contexts,
            repository: config.repository_path(),
        })
    }
}

/// Allocates and tracks isolation contexts.
///
/// All bookkeeping happens under one lock so the disjointness check and
/// the reservation of a namespace are atomic with respect to each other.
pub struct IsolationManager {
    config: IsolationConfig,
    git: Option<GitOps>,
    contexts: Mutex<HashMap<ContextId, (IsolationContext, ContextState)>>,
}

impl IsolationManager {
    /// Create a manager. Opens the repository when one is configured.
    pub fn new(config: IsolationConfig) -> Result<Self> {
        let git = match &config.repository {
            Some(path) => Some(GitOps::new(path)?),
            None => None,
        };
        std::fs::create_dir_all(&config.root)?;
        Ok(Self {
            config,
            git,
            contexts: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContextId, (IsolationContext, ContextState)>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate a context for `task_id`.
    ///
    /// # Errors
    /// Returns [`Error::IsolationAllocationFailed`] when the active-context
    /// cap is reached or the namespace would overlap a live one. Callers
    /// treat this as backpressure and retry later.
    pub fn allocate(&self, run_id: &RunId, task_id: &TaskId) -> Result<IsolationContext> {
        let id = ContextId::new();
        // Distinct ids may sanitize to the same leaf; the context id keeps
        // both the directory and the branch unique.
        let leaf = format!("{}-{}", sanitize(task_id.as_str()), id.short());
        let namespace = self.config.root.join(run_id.short()).join(&leaf);
        let branch = format!("{}/{}/{}", self.config.branch_prefix, run_id.short(), leaf);

        let context = IsolationContext {
            id,
            run_id: *run_id,
            task_id: task_id.clone(),
            branch,
            namespace,
            created_at: Utc::now(),
            worktree: self.git.is_some(),
        };

        {
            let mut contexts = self.lock();
            let active = contexts
                .values()
                .filter(|(_, state)| *state == ContextState::Active)
                .count();
            if active >= self.config.max_active {
                return Err(Error::IsolationAllocationFailed {
                    task_id: task_id.clone(),
                    reason: format!("{} of {} contexts active", active, self.config.max_active),
                });
            }
            if let Some((existing, _)) = contexts.values().find(|(ctx, state)| {
                ctx.run_id == *run_id && ctx.task_id == *task_id && *state != ContextState::Retained
            }) {
                return Err(Error::Validation(format!(
                    "task {} already holds context {}",
                    task_id, existing.id
                )));
            }
            if let Some((other, _)) = contexts
                .values()
                .find(|(ctx, _)| ctx.overlaps(&context.namespace))
            {
                return Err(Error::IsolationAllocationFailed {
                    task_id: task_id.clone(),
                    reason: format!(
                        "namespace {} overlaps {}",
                        context.namespace.display(),
                        other.namespace.display()
                    ),
                });
            }
            if let Some((other, _)) = contexts
                .values()
                .find(|(ctx, _)| ctx.branch == context.branch)
            {
                return Err(Error::IsolationAllocationFailed {
                    task_id: task_id.clone(),
                    reason: format!("branch {} is held by task {}", context.branch, other.task_id),
                });
            }
            contexts.insert(id, (context.clone(), ContextState::Active));
        }

        if let Err(e) = self.provision(&context) {
            self.lock().remove(&id);
            return Err(e);
        }

        tracing::debug!(
            task = %task_id,
            context = %id.short(),
            namespace = %context.namespace.display(),
            "allocated isolation context"
        );
        Ok(context)
    }

    fn provision(&self, context: &IsolationContext) -> Result<()> {
        match &self.git {
            Some(git) => git.create_worktree(&context.branch, &context.namespace),
            None => Ok(std::fs::create_dir_all(&context.namespace)?),
        }
    }

    fn destroy(&self, context: &IsolationContext) -> Result<()> {
        match &self.git {
            Some(git) if context.worktree => {
                git.remove_worktree(&context.namespace)?;
                git.delete_branch(&context.branch)
            }
            _ => {
                if context.namespace.exists() {
                    std::fs::remove_dir_all(&context.namespace)?;
                }
                Ok(())
            }
        }
    }

    fn set_state(&self, context: &IsolationContext, state: ContextState) {
        if let Some(entry) = self.lock().get_mut(&context.id) {
            entry.1 = state;
        }
    }

    /// Execution is over; the context waits for its result to be merged.
    pub fn mark_idle(&self, context: &IsolationContext) {
        self.set_state(context, ContextState::Idle);
    }

    /// Keep the context for diagnostics. It no longer counts as active.
    pub fn retain(&self, context: &IsolationContext) {
        self.set_state(context, ContextState::Retained);
        tracing::info!(
            task = %context.task_id,
            namespace = %context.namespace.display(),
            "retaining isolation context for inspection"
        );
    }

    /// Register a retained context recovered from a persisted manifest.
    pub fn adopt_retained(&self, context: IsolationContext) {
        self.lock()
            .entry(context.id)
            .or_insert((context, ContextState::Retained));
    }

    /// Destroy a context. Releasing an unknown or already released
    /// context is a no-op.
    pub fn release(&self, context: &IsolationContext) -> Result<()> {
        let removed = self.lock().remove(&context.id);
        match removed {
            Some((ctx, _)) => {
                self.destroy(&ctx)?;
                tracing::debug!(task = %ctx.task_id, context = %ctx.id.short(), "released context");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Explicitly remove a retained context. Returns false if unknown.
    pub fn cleanup(&self, id: &ContextId) -> Result<bool> {
        let context = self.lock().get(id).map(|(ctx, _)| ctx.clone());
        match context {
            Some(ctx) => {
                self.release(&ctx)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove every retained context, optionally only those of one run.
    pub fn cleanup_retained(&self, run_id: Option<&RunId>) -> Result<usize> {
        let targets: Vec<IsolationContext> = self
            .lock()
            .values()
            .filter(|(ctx, state)| {
                *state == ContextState::Retained && run_id.map_or(true, |run| *run == ctx.run_id)
            })
            .map(|(ctx, _)| ctx.clone())
            .collect();
        for ctx in &targets {
            self.release(ctx)?;
        }
        Ok(targets.len())
    }

    pub fn state_of(&self, id: &ContextId) -> Option<ContextState> {
        self.lock().get(id).map(|(_, state)| *state)
    }

    fn in_state(&self, wanted: ContextState) -> Vec<IsolationContext> {
        let mut found: Vec<IsolationContext> = self
            .lock()
            .values()
            .filter(|(_, state)| *state == wanted)
            .map(|(ctx, _)| ctx.clone())
            .collect();
        found.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        found
    }

    /// Contexts with a task currently executing.
    pub fn active(&self) -> Vec<IsolationContext> {
        self.in_state(ContextState::Active)
    }

    /// Contexts kept after failures.
    pub fn retained(&self) -> Vec<IsolationContext> {
        self.in_state(ContextState::Retained)
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|(_, state)| *state == ContextState::Active)
            .count()
    }

    /// Number of contexts not yet released.
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }
}

/// Make a task id safe for use in branch and directory names.
pub fn sanitize(raw: &str) -> String {
    static UNSAFE: OnceLock<Regex> = OnceLock::new();
    let re = UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("valid regex"));
    let cleaned = re.replace_all(raw, "-");
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}
