//! Task graph (directed acyclic graph) for dependency management.
//!
//! The graph is validated once at construction and afterwards only changes
//! task status. Status mutators are crate-private: the scheduler is the
//! single writer, everything else reads.

use crate::core::task::{Task, TaskId, TaskSpec, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Final status of a graph once every task is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    /// Every task completed.
    AllCompleted,
    /// At least one required task completed, but not every task did.
    PartialFailure,
    /// No required task completed.
    TotalFailure,
}

impl std::fmt::Display for GraphStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphStatus::AllCompleted => write!(f, "all_completed"),
            GraphStatus::PartialFailure => write!(f, "partial_failure"),
            GraphStatus::TotalFailure => write!(f, "total_failure"),
        }
    }
}

/// Per-status task counts, handy for logging and status queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// The task dependency graph for one query.
///
/// Nodes are tasks; an edge `a -> b` means `b` depends on `a`.
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Build and validate a graph from planner output.
    ///
    /// `edges` are `(dependency, dependent)` pairs and are merged with each
    /// node's own `depends_on` list.
    ///
    /// # Errors
    /// - `DuplicateTask` if two nodes share an id
    /// - `DanglingDependency` if an edge or `depends_on` names an unknown id
    /// - `CycleDetected` if the dependencies form a cycle
    pub fn build(nodes: Vec<TaskSpec>, edges: Vec<(TaskId, TaskId)>) -> Result<Self> {
        let any_required = nodes.iter().any(|n| n.required == Some(true));
        let explicitly_optional: Vec<TaskId> = nodes
            .iter()
            .filter(|n| n.required == Some(false))
            .map(|n| n.id.clone())
            .collect();

        let mut graph = DiGraph::new();
        let mut task_index = HashMap::new();

        for spec in nodes {
            if task_index.contains_key(&spec.id) {
                return Err(Error::DuplicateTask(spec.id));
            }
            let id = spec.id.clone();
            let index = graph.add_node(Task::from_spec(spec));
            task_index.insert(id, index);
        }

        for (from, to) in edges {
            let to_index = *task_index.get(&to).ok_or_else(|| Error::DanglingDependency {
                task: from.clone(),
                missing: to.clone(),
            })?;
            if !task_index.contains_key(&from) {
                return Err(Error::DanglingDependency {
                    task: to,
                    missing: from,
                });
            }
            graph[to_index].depends_on.insert(from);
        }

        let mut pairs = Vec::new();
        for (id, &index) in &task_index {
            for dep in &graph[index].depends_on {
                let dep_index = *task_index.get(dep).ok_or_else(|| Error::DanglingDependency {
                    task: id.clone(),
                    missing: dep.clone(),
                })?;
                pairs.push((dep_index, index));
            }
        }
        for (from, to) in pairs {
            graph.update_edge(from, to, ());
        }

        if let Err(cycle) = toposort(&graph, None) {
            return Err(Error::CycleDetected {
                task: graph[cycle.node_id()].id.clone(),
            });
        }

        if !any_required {
            let sinks: Vec<NodeIndex> = graph
                .node_indices()
                .filter(|&i| graph.neighbors_directed(i, Direction::Outgoing).next().is_none())
                .collect();
            for index in sinks {
                if !explicitly_optional.contains(&graph[index].id) {
                    graph[index].required = true;
                }
            }
        }

        Ok(Self { graph, task_index })
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index.get(id).map(|&index| &self.graph[index])
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        let index = *self
            .task_index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        Ok(&mut self.graph[index])
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Direct successors: tasks that list `id` as a dependency.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .map(|n| &self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Every task reachable from `id` along dependency edges, excluding
    /// `id` itself.
    pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut out = Vec::new();
        while let Some(node) = bfs.next(&self.graph) {
            if node != start {
                out.push(self.graph[node].id.clone());
            }
        }
        out
    }

    /// Every task `id` transitively depends on.
    pub fn ancestors(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, start);
        let mut out = Vec::new();
        while let Some(node) = bfs.next(reversed) {
            if node != start {
                out.push(self.graph[node].id.clone());
            }
        }
        out
    }

    /// Tasks in an order where each task comes after all its dependencies.
    pub fn topological_order(&self) -> Vec<TaskId> {
        // Acyclicity is checked in `build`, so toposort cannot fail here.
        toposort(&self.graph, None)
            .map(|sorted| sorted.into_iter().map(|i| self.graph[i].id.clone()).collect())
            .unwrap_or_default()
    }

    // ========== Scheduling Queries ==========

    /// Pending tasks whose dependencies have all completed, highest
    /// priority first (ties broken by id for a stable order).
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        let mut ready: Vec<&Task> = self
            .graph
            .node_indices()
            .filter_map(|index| {
                let task = &self.graph[index];
                if task.status != TaskStatus::Pending {
                    return None;
                }
                let deps_done = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| self.graph[dep].is_completed());
                deps_done.then_some(task)
            })
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        ready.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Outputs of the completed direct dependencies of `id`.
    pub fn upstream_outputs(&self, id: &TaskId) -> BTreeMap<TaskId, Value> {
        let Some(&index) = self.task_index.get(id) else {
            return BTreeMap::new();
        };
        self.graph
            .neighbors_directed(index, Direction::Incoming)
            .filter_map(|dep| {
                let task = &self.graph[dep];
                task.output.clone().map(|out| (task.id.clone(), out))
            })
            .collect()
    }

    /// Outputs of every completed task.
    pub fn completed_outputs(&self) -> BTreeMap<TaskId, Value> {
        self.graph
            .node_weights()
            .filter_map(|t| t.output.clone().map(|out| (t.id.clone(), out)))
            .collect()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.graph.node_weights() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed { .. } => counts.failed += 1,
                TaskStatus::Cancelled { .. } => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn all_terminal(&self) -> bool {
        self.graph.node_weights().all(|t| t.is_finished())
    }

    /// Whether every required task completed.
    pub fn required_completed(&self) -> bool {
        self.graph
            .node_weights()
            .filter(|t| t.required)
            .all(|t| t.is_completed())
    }

    /// Summarise the graph's final state.
    pub fn status(&self) -> GraphStatus {
        if self.graph.node_weights().all(|t| t.is_completed()) {
            return GraphStatus::AllCompleted;
        }
        let any_required_done = self
            .graph
            .node_weights()
            .any(|t| t.required && t.is_completed());
        if any_required_done {
            GraphStatus::PartialFailure
        } else {
            GraphStatus::TotalFailure
        }
    }

    // ========== Scheduler-only mutators ==========

    pub(crate) fn mark_ready(&mut self, id: &TaskId) -> Result<()> {
        self.task_mut(id)?.mark_ready()
    }

    pub(crate) fn mark_running(&mut self, id: &TaskId) -> Result<u32> {
        let task = self.task_mut(id)?;
        task.start()?;
        Ok(task.attempt)
    }

    pub(crate) fn requeue(&mut self, id: &TaskId) -> Result<()> {
        self.task_mut(id)?.requeue()
    }

    pub(crate) fn mark_completed(&mut self, id: &TaskId, output: Value) -> Result<()> {
        self.task_mut(id)?.complete(output)
    }

    pub(crate) fn mark_failed(&mut self, id: &TaskId, error: &str) -> Result<()> {
        self.task_mut(id)?.fail(error)
    }

    pub(crate) fn mark_cancelled(&mut self, id: &TaskId, reason: &str) -> Result<()> {
        self.task_mut(id)?.cancel(reason)
    }

    /// Cancel every non-terminal descendant of `id`. Returns the ids that
    /// were cancelled.
    pub(crate) fn cancel_descendants(&mut self, id: &TaskId, reason: &str) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        for desc in self.descendants(id) {
            if let Ok(task) = self.task_mut(&desc) {
                if !task.is_finished() && task.cancel(reason).is_ok() {
                    cancelled.push(desc);
                }
            }
        }
        cancelled
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
