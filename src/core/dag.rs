//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! `TaskDAG` is built once from a task set and never has edges added
//! afterwards; a changed task set produces a new DAG via [`TaskDAG::update`].
//! Construction assigns every task either to an execution layer (Kahn's
//! algorithm, ties broken by ascending id) or to the blocked set, so a
//! cycle in one part of the graph never hides the rest of it.

use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Why a task was left out of the execution layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum BlockReason {
    /// The task is a member of a dependency cycle.
    Cycle,
    /// The task names a dependency that is not in the task set.
    MissingDependency {
        /// The unknown dependency id.
        dependency: TaskId,
    },
    /// A direct dependency is itself blocked.
    BlockedBy {
        /// The blocked dependency.
        dependency: TaskId,
    },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Cycle => write!(f, "member of a dependency cycle"),
            BlockReason::MissingDependency { dependency } => {
                write!(f, "unknown dependency {}", dependency)
            }
            BlockReason::BlockedBy { dependency } => {
                write!(f, "depends on blocked task {}", dependency)
            }
        }
    }
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.ready + self.running + self.succeeded + self.failed + self.timed_out
    }

    /// Tasks in a terminal status.
    pub fn resolved(&self) -> usize {
        self.succeeded + self.failed + self.timed_out
    }

    /// Resolved tasks as a percentage of all tasks. An empty set is complete.
    pub fn progress(&self) -> f64 {
        match self.total() {
            0 => 100.0,
            total => self.resolved() as f64 * 100.0 / total as f64,
        }
    }

    pub fn tally<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut counts = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed { .. } => counts.failed += 1,
                TaskStatus::TimedOut => counts.timed_out += 1,
            }
        }
        counts
    }
}

/// The task dependency graph.
///
/// Nodes are tasks and edges point from a dependency to its dependent.
pub struct TaskDAG {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Execution layers, each sorted by id.
    layers: Vec<Vec<TaskId>>,
    /// Layer number for every layered task.
    layer_index: HashMap<TaskId, usize>,
    /// Tasks excluded from the layers.
    blocked: BTreeMap<TaskId, BlockReason>,
    /// Cyclic members grouped per strongly connected component.
    cycles: Vec<Vec<TaskId>>,
}

impl TaskDAG {
    /// Build a DAG from a task set.
    ///
    /// Cycles and unknown dependencies do not fail the build; the affected
    /// tasks (and everything downstream of them) land in [`TaskDAG::blocked`]
    /// while the remaining tasks are layered normally.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateTask`] if two tasks share an id.
    pub fn build(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let mut sorted: Vec<Task> = tasks.into_iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));

        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();
        for task in sorted {
            if task_index.contains_key(&task.id) {
                return Err(Error::DuplicateTask(task.id));
            }
            let id = task.id.clone();
            let index = graph.add_node(task);
            task_index.insert(id, index);
        }

        let mut missing: BTreeMap<NodeIndex, TaskId> = BTreeMap::new();
        let mut edges = Vec::new();
        for index in graph.node_indices() {
            let deps: BTreeSet<&TaskId> = graph[index].dependencies.iter().collect();
            for dep in deps {
                match task_index.get(dep) {
                    Some(&from) => edges.push((from, index)),
                    None => {
                        missing.entry(index).or_insert_with(|| dep.clone());
                    }
                }
            }
        }
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        let mut dag = Self {
            graph,
            task_index,
            layers: Vec::new(),
            layer_index: HashMap::new(),
            blocked: BTreeMap::new(),
            cycles: Vec::new(),
        };
        dag.assign_layers(&missing);
        dag.classify_unassigned(&missing);

        tracing::debug!(
            tasks = dag.task_count(),
            layers = dag.layers.len(),
            blocked = dag.blocked.len(),
            "built task DAG"
        );
        Ok(dag)
    }

    /// Build a DAG, failing if any cycle exists.
    ///
    /// # Errors
    /// Returns [`Error::CycleDetected`] naming exactly the cyclic members.
    pub fn build_strict(tasks: impl IntoIterator<Item = Task>) -> Result<Self> {
        let dag = Self::build(tasks)?;
        match dag.cycle_error() {
            Some(err) => Err(err),
            None => Ok(dag),
        }
    }

    /// Rebuild the DAG with `changed` tasks inserted or replaced.
    ///
    /// Unchanged tasks keep their current status. Calling this repeatedly
    /// with the same input yields the same layers.
    pub fn update(&self, changed: impl IntoIterator<Item = Task>) -> Result<Self> {
        let mut tasks: BTreeMap<TaskId, Task> = self
            .graph
            .node_weights()
            .map(|t| (t.id.clone(), t.clone()))
            .collect();
        for task in changed {
            tasks.insert(task.id.clone(), task);
        }
        Self::build(tasks.into_values())
    }

    /// Kahn's algorithm: each round's frontier becomes one layer.
    fn assign_layers(&mut self, missing: &BTreeMap<NodeIndex, TaskId>) {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|i| (i, self.graph.neighbors_directed(i, Direction::Incoming).count()))
            .collect();

        let mut frontier: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|i| in_degree[i] == 0 && !missing.contains_key(i))
            .collect();

        while !frontier.is_empty() {
            frontier.sort_by(|a, b| self.graph[*a].id.cmp(&self.graph[*b].id));
            let mut next = Vec::new();
            for &index in &frontier {
                for dependent in self.graph.neighbors_directed(index, Direction::Outgoing) {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree -= 1;
                        if *degree == 0 && !missing.contains_key(&dependent) {
                            next.push(dependent);
                        }
                    }
                }
            }

            let layer_number = self.layers.len();
            let layer: Vec<TaskId> = frontier
                .iter()
                .map(|&i| self.graph[i].id.clone())
                .collect();
            for id in &layer {
                self.layer_index.insert(id.clone(), layer_number);
            }
            self.layers.push(layer);
            frontier = next;
        }
    }

    /// Sort tasks Kahn could not layer into cycles and their casualties.
    fn classify_unassigned(&mut self, missing: &BTreeMap<NodeIndex, TaskId>) {
        let unassigned: BTreeSet<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|i| !self.layer_index.contains_key(&self.graph[*i].id))
            .collect();
        if unassigned.is_empty() {
            return;
        }

        for component in tarjan_scc(&self.graph) {
            let is_cycle = component.len() > 1
                || component
                    .first()
                    .is_some_and(|&i| self.graph.contains_edge(i, i));
            if !is_cycle {
                continue;
            }
            let mut members: Vec<TaskId> = component
                .iter()
                .map(|&i| self.graph[i].id.clone())
                .collect();
            members.sort();
            for id in &members {
                self.blocked.insert(id.clone(), BlockReason::Cycle);
            }
            self.cycles.push(members);
        }
        self.cycles.sort();

        for (&index, dependency) in missing {
            self.blocked
                .entry(self.graph[index].id.clone())
                .or_insert_with(|| BlockReason::MissingDependency {
                    dependency: dependency.clone(),
                });
        }

        // Remaining tasks sit downstream of a cycle or a missing dependency.
        // Walk outward from what is already classified so every task names
        // the direct dependency that blocks it.
        let mut queue: VecDeque<NodeIndex> = unassigned
            .iter()
            .copied()
            .filter(|i| self.blocked.contains_key(&self.graph[*i].id))
            .collect();
        while let Some(index) = queue.pop_front() {
            let blocker = self.graph[index].id.clone();
            let mut dependents: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .collect();
            dependents.sort_by(|a, b| self.graph[*a].id.cmp(&self.graph[*b].id));
            for dependent in dependents {
                let id = self.graph[dependent].id.clone();
                if self.blocked.contains_key(&id) {
                    continue;
                }
                self.blocked.insert(
                    id,
                    BlockReason::BlockedBy {
                        dependency: blocker.clone(),
                    },
                );
                queue.push_back(dependent);
            }
        }
    }

    /// The [`Error::CycleDetected`] for this DAG, if it contains cycles.
    pub fn cycle_error(&self) -> Option<Error> {
        if self.cycles.is_empty() {
            return None;
        }
        let mut members: Vec<TaskId> = self.cycles.iter().flatten().cloned().collect();
        members.sort();
        Some(Error::CycleDetected { members })
    }

    /// Execution layers in dispatch order.
    pub fn layers(&self) -> &[Vec<TaskId>] {
        &self.layers
    }

    /// The layer a task was assigned to, if it was layered.
    pub fn layer_of(&self, id: &TaskId) -> Option<usize> {
        self.layer_index.get(id).copied()
    }

    /// Tasks excluded from the layers, with the reason.
    pub fn blocked(&self) -> &BTreeMap<TaskId, BlockReason> {
        &self.blocked
    }

    /// Members of each detected cycle.
    pub fn cycles(&self) -> &[Vec<TaskId>] {
        &self.cycles
    }

    /// Get a reference to a task by its ID.
    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get all tasks, ordered by id.
    pub fn tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the DAG is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if the DAG contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Get all tasks that the given task depends on.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Get all tasks that directly depend on the given task.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut tasks: Vec<&Task> = self
            .graph
            .neighbors_directed(index, direction)
            .filter_map(|neighbor| self.graph.node_weight(neighbor))
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks.dedup_by(|a, b| a.id == b.id);
        tasks
    }

    /// Every task reachable downstream of the given task.
    pub fn transitive_dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let mut seen = BTreeSet::new();
        let Some(&start) = self.task_index.get(id) else {
            return seen;
        };
        let mut queue = VecDeque::from([start]);
        while let Some(index) = queue.pop_front() {
            for dependent in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if seen.insert(self.graph[dependent].id.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        seen
    }

    /// True when every dependency of the task has succeeded.
    pub fn dependencies_succeeded(&self, id: &TaskId) -> bool {
        self.contains_task(id)
            && self
                .dependencies(id)
                .iter()
                .all(|dep| dep.status == TaskStatus::Succeeded)
    }

    /// The first dependency (by id) that failed or timed out, if any.
    pub fn failed_dependency(&self, id: &TaskId) -> Option<&Task> {
        self.dependencies(id)
            .into_iter()
            .find(|dep| dep.blocks_dependents())
    }

    /// Layered tasks that can start now, in layer then id order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.layers
            .iter()
            .flatten()
            .filter_map(|id| self.task(id))
            .filter(|task| task.can_start() && self.dependencies_succeeded(&task.id))
            .collect()
    }

    /// Tasks in `layer` that can start now.
    pub fn ready_in_layer(&self, layer: usize) -> Vec<&Task> {
        self.layers
            .get(layer)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.task(id))
                    .filter(|task| task.can_start() && self.dependencies_succeeded(&task.id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True when no task in `layer` is still pending dispatch or running
    /// with all of its dependencies satisfied.
    pub fn layer_resolved(&self, layer: usize) -> bool {
        self.layers.get(layer).map_or(true, |ids| {
            ids.iter().filter_map(|id| self.task(id)).all(|task| {
                task.is_finished()
                    || (task.can_start() && !self.dependencies_succeeded(&task.id))
            })
        })
    }

    /// Tasks in layered order, each after all of its dependencies.
    pub fn topological_order(&self) -> Vec<&Task> {
        self.layers
            .iter()
            .flatten()
            .filter_map(|id| self.task(id))
            .collect()
    }

    /// Count tasks per status.
    pub fn status_counts(&self) -> StatusCounts {
        StatusCounts::tally(self.graph.node_weights())
    }

    /// Share of tasks in a terminal status, 0-100.
    pub fn progress(&self) -> f64 {
        self.status_counts().progress()
    }

    /// Set a task's status. Only the scheduler calls this.
    ///
    /// # Errors
    /// Returns [`Error::TaskNotFound`] if the id is unknown.
    pub fn set_status(&mut self, id: &TaskId, status: TaskStatus) -> Result<()> {
        let task = self.task_mut(id)?;
        match status {
            TaskStatus::Pending => task.reset(),
            TaskStatus::Ready => task.mark_ready(),
            TaskStatus::Running => task.start(),
            TaskStatus::Succeeded => task.succeed(),
            TaskStatus::Failed { error } => task.fail(&error),
            TaskStatus::TimedOut => task.time_out(),
        }
        Ok(())
    }

    pub(crate) fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        let index = *self
            .task_index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        Ok(&mut self.graph[index])
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("layers", &self.layers.len())
            .field("blocked", &self.blocked.len())
            .finish()
    }
}
