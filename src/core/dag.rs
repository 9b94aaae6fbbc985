//! Task graph and dependency resolution.
//!
//! `TaskGraph` holds the tasks of one planning cycle as a petgraph `DiGraph`.
//! Edges run from a dependency to its dependent. The shape is fixed at
//! construction; afterwards only task statuses change.

use crate::core::fingerprint::Fingerprint;
use crate::core::task::{Task, TaskError, TaskId, TaskSpec, TaskStatus};
use crate::error::{ConstructionError, Error, Result, ToolError};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// A result that survived an earlier iteration and may be adopted by a re-plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarriedResult {
    pub fingerprint: Fingerprint,
    pub value: Value,
    /// Iteration in which the result was produced.
    pub iteration: u32,
}

/// Per-status task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.ready + self.running + self.succeeded + self.failed + self.skipped
    }

    /// Tasks that have not reached a terminal status.
    pub fn unfinished(&self) -> usize {
        self.pending + self.ready + self.running
    }
}

/// The task dependency graph for one planning cycle.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "Vec<Task>", try_from = "Vec<Task>")]
pub struct TaskGraph {
    graph: DiGraph<Task, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a graph from planner output.
    ///
    /// Fails on duplicate ids, dependencies on unknown ids, and cycles.
    pub fn build(specs: Vec<TaskSpec>) -> std::result::Result<Self, ConstructionError> {
        Self::from_tasks(specs.into_iter().map(Task::from_spec).collect())
    }

    /// Build a graph from tasks that may already carry statuses.
    ///
    /// Runs the same validation as [`TaskGraph::build`].
    pub fn from_tasks(tasks: Vec<Task>) -> std::result::Result<Self, ConstructionError> {
        let mut dag = Self::new();

        for task in tasks {
            if dag.task_index.contains_key(&task.id) {
                return Err(ConstructionError::DuplicateTask(task.id));
            }
            let id = task.id.clone();
            let index = dag.graph.add_node(task);
            dag.task_index.insert(id, index);
        }

        let mut edges = Vec::new();
        for index in dag.graph.node_indices() {
            let task = &dag.graph[index];
            for dep in &task.depends_on {
                let dep_index =
                    dag.task_index
                        .get(dep)
                        .ok_or_else(|| ConstructionError::UnknownDependency {
                            task: task.id.clone(),
                            dependency: dep.clone(),
                        })?;
                edges.push((*dep_index, index));
            }
        }
        for (from, to) in edges {
            dag.graph.add_edge(from, to, ());
        }

        if let Err(remaining) = dag.kahn_order() {
            return Err(ConstructionError::Cycle {
                tasks: dag.find_cycle(&remaining),
            });
        }

        Ok(dag)
    }

    /// Topological order via Kahn's algorithm.
    ///
    /// On failure returns the nodes that were never reached, all of which sit
    /// on or behind a cycle.
    fn kahn_order(&self) -> std::result::Result<Vec<NodeIndex>, HashSet<NodeIndex>> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                (
                    n,
                    self.graph.neighbors_directed(n, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut roots: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        roots.sort_by(|a, b| self.graph[*a].id.cmp(&self.graph[*b].id));
        let mut queue: VecDeque<NodeIndex> = roots.into();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        if order.len() == self.graph.node_count() {
            Ok(order)
        } else {
            let visited: HashSet<NodeIndex> = order.into_iter().collect();
            Err(self
                .graph
                .node_indices()
                .filter(|n| !visited.contains(n))
                .collect())
        }
    }

    /// Walk dependency edges among unvisited nodes until one repeats.
    ///
    /// Every unvisited node still has an unvisited dependency, so the walk
    /// always closes a loop. The result lists the cycle in execution order
    /// with the first task repeated at the end.
    fn find_cycle(&self, remaining: &HashSet<NodeIndex>) -> Vec<TaskId> {
        let Some(start) = remaining
            .iter()
            .min_by(|a, b| self.graph[**a].id.cmp(&self.graph[**b].id))
            .copied()
        else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut seen: HashMap<NodeIndex, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let next = self
                .graph
                .neighbors_directed(current, Direction::Incoming)
                .filter(|n| remaining.contains(n))
                .min_by(|a, b| self.graph[*a].id.cmp(&self.graph[*b].id));
            let Some(next) = next else {
                break;
            };
            if let Some(&pos) = seen.get(&next) {
                let mut cycle: Vec<TaskId> = path[pos..]
                    .iter()
                    .rev()
                    .map(|n| self.graph[*n].id.clone())
                    .collect();
                cycle.push(cycle[0].clone());
                return cycle;
            }
            seen.insert(next, path.len());
            path.push(next);
            current = next;
        }
        path.iter().map(|n| self.graph[*n].id.clone()).collect()
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        let index = *self
            .task_index
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        Ok(&mut self.graph[index])
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

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// All tasks, ordered by id.
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.graph.node_weights().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    /// Tasks that `id` depends on.
    pub fn dependencies(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend on `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, dir: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, dir)
                .map(|n| &self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Tasks in an order where every task follows its dependencies.
    pub fn topological_order(&self) -> Vec<&Task> {
        // Construction rejects cycles, so Kahn's algorithm always completes.
        self.kahn_order()
            .unwrap_or_default()
            .into_iter()
            .map(|n| &self.graph[n])
            .collect()
    }

    // ========== Resolution ==========

    /// Tasks eligible to start now, ordered by id.
    ///
    /// A task qualifies when it is pending or ready and every dependency has
    /// succeeded or been skipped. This is a pure function of current
    /// statuses; run [`TaskGraph::cascade_skips`] first so that dependents
    /// of failed tasks are skipped rather than released.
    pub fn ready_set(&self) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .graph
            .node_indices()
            .filter(|&index| {
                let task = &self.graph[index];
                matches!(task.status, TaskStatus::Pending | TaskStatus::Ready)
                    && self
                        .graph
                        .neighbors_directed(index, Direction::Incoming)
                        .all(|dep| self.graph[dep].status.unblocks_dependents())
            })
            .map(|index| self.graph[index].id.clone())
            .collect();
        ready.sort();
        ready
    }

    /// Move every task in the ready set from pending to ready.
    pub fn refresh_ready(&mut self) -> Vec<TaskId> {
        let ready = self.ready_set();
        for id in &ready {
            if let Some(&index) = self.task_index.get(id) {
                // Ready-set members are pending or ready, so this cannot fail.
                let _ = self.graph[index].mark_ready();
            }
        }
        ready
    }

    /// Skip every unfinished task downstream of a failed task.
    ///
    /// Propagates transitively. Returns the ids skipped by this call.
    pub fn cascade_skips(&mut self) -> Vec<TaskId> {
        let mut failed: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&n| self.graph[n].status == TaskStatus::Failed)
            .collect();
        failed.sort_by(|a, b| self.graph[*a].id.cmp(&self.graph[*b].id));

        let mut skipped = Vec::new();
        for root in failed {
            let root_id = self.graph[root].id.clone();
            let mut dfs = Dfs::new(&self.graph, root);
            while let Some(node) = dfs.next(&self.graph) {
                if node == root {
                    continue;
                }
                let task = &mut self.graph[node];
                if task.status != TaskStatus::Running && task.skip(root_id.clone()) {
                    skipped.push(task.id.clone());
                }
            }
        }
        skipped.sort();
        skipped
    }

    /// Transition a ready task to running.
    pub fn start_task(&mut self, id: &TaskId) -> Result<&Task> {
        let task = self.task_mut(id)?;
        task.start()?;
        Ok(task)
    }

    /// Fold a tool outcome into the graph.
    ///
    /// Idempotent: re-delivering a completion for a terminal task is a no-op
    /// and returns `Ok(false)`.
    pub fn finish_task(
        &mut self,
        id: &TaskId,
        attempt: u32,
        outcome: &std::result::Result<Value, ToolError>,
    ) -> Result<bool> {
        let task = self.task_mut(id)?;
        Ok(match outcome {
            Ok(value) => task.succeed(attempt, value.clone()),
            Err(err) => task.fail(attempt, TaskError::from(err)),
        })
    }

    /// Return interrupted tasks to pending. Used after loading a checkpoint.
    pub fn reset_interrupted(&mut self) -> Vec<TaskId> {
        let mut reset = Vec::new();
        for task in self.graph.node_weights_mut() {
            if task.reset_interrupted() {
                reset.push(task.id.clone());
            }
        }
        reset.sort();
        reset
    }

    /// Mark tasks as succeeded when an earlier iteration already produced
    /// their result.
    ///
    /// A task adopts a carried result only if its fingerprint matches and all
    /// of its dependencies were adopted too. Returns the adopted ids.
    pub fn adopt_results(&mut self, carried: &BTreeMap<TaskId, CarriedResult>) -> Vec<TaskId> {
        let order: Vec<NodeIndex> = self.kahn_order().unwrap_or_default();
        let mut adopted = Vec::new();
        for index in order {
            let deps_done = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .all(|dep| self.graph[dep].status == TaskStatus::Succeeded);
            let task = &mut self.graph[index];
            if !deps_done || task.is_finished() {
                continue;
            }
            if let Some(prior) = carried.get(&task.id) {
                if prior.fingerprint == task.fingerprint() {
                    let attempt = task.attempt;
                    task.succeed(attempt, prior.value.clone());
                    adopted.push(task.id.clone());
                }
            }
        }
        adopted.sort();
        adopted
    }

    /// Results of every succeeded task, keyed by id.
    pub fn succeeded_results(&self) -> BTreeMap<TaskId, (Fingerprint, Value)> {
        self.graph
            .node_weights()
            .filter(|t| t.status == TaskStatus::Succeeded)
            .filter_map(|t| {
                t.result
                    .as_ref()
                    .map(|v| (t.id.clone(), (t.fingerprint(), v.clone())))
            })
            .collect()
    }

    /// Fingerprint of every task, keyed by id.
    pub fn fingerprints(&self) -> BTreeMap<TaskId, Fingerprint> {
        self.graph
            .node_weights()
            .map(|t| (t.id.clone(), t.fingerprint()))
            .collect()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.graph.node_weights() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }

    /// Check if every task reached a terminal status.
    pub fn all_finished(&self) -> bool {
        self.graph.node_weights().all(Task::is_finished)
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
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

impl From<TaskGraph> for Vec<Task> {
    fn from(graph: TaskGraph) -> Self {
        let (nodes, _) = graph.graph.into_nodes_edges();
        let mut tasks: Vec<Task> = nodes.into_iter().map(|n| n.weight).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }
}

impl TryFrom<Vec<Task>> for TaskGraph {
    type Error = ConstructionError;

    fn try_from(tasks: Vec<Task>) -> std::result::Result<Self, Self::Error> {
        Self::from_tasks(tasks)
    }
}
