//! Task graph (DAG) for subtask dependencies.
//!
//! A [`TaskGraph`] holds the subtasks of one goal as nodes of a petgraph
//! `DiGraph`, with an edge from each dependency to its dependent. Graphs
//! are only constructed through `TaskGraphScheduler::build`, which rejects
//! duplicate ids, dangling dependencies and cycles first.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::core::task::{Subtask, SubtaskId, SubtaskStatus};
use crate::worker::WorkerId;

/// Rough size of a goal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    #[default]
    Simple,
    Medium,
    Complex,
}

/// Words that usually separate steps in a goal description.
const STEP_MARKERS: &[&str] = &["and", "then", "after", "before", "also", "finally"];

impl Complexity {
    /// Cheap heuristic over the goal text.
    ///
    /// Counts words and step markers (connectives and clause punctuation).
    /// Short goals without markers are simple; long goals or goals with
    /// three or more markers are complex.
    pub fn assess(goal: &str) -> Self {
        let words: Vec<String> = goal
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        let connectives = words
            .iter()
            .filter(|w| STEP_MARKERS.contains(&w.as_str()))
            .count();
        let punctuation = goal
            .trim_end_matches(['.', '!', '?'])
            .chars()
            .filter(|c| matches!(c, ',' | ';' | '.' | '\n'))
            .count();
        let markers = connectives + punctuation;

        if words.len() > 40 || markers >= 3 {
            Complexity::Complex
        } else if words.len() <= 12 && markers == 0 {
            Complexity::Simple
        } else {
            Complexity::Medium
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

impl std::str::FromStr for Complexity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Ok(Complexity::Simple),
            "medium" => Ok(Complexity::Medium),
            "complex" => Ok(Complexity::Complex),
            other => Err(format!("unknown complexity: {}", other)),
        }
    }
}

/// How the orchestrator runs a graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Sequential => write!(f, "sequential"),
            ExecutionMode::Parallel => write!(f, "parallel"),
        }
    }
}

/// Counts of subtasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// The validated subtask dependency graph for one goal.
pub struct TaskGraph {
    goal: String,
    complexity: Complexity,
    /// Edges point from a dependency to its dependent.
    graph: DiGraph<Subtask, ()>,
    index: HashMap<SubtaskId, NodeIndex>,
    /// Subtask ids in declaration order.
    order: Vec<SubtaskId>,
    pub(crate) mode: ExecutionMode,
    pub(crate) total_duration: Duration,
    required_workers: BTreeSet<WorkerId>,
}

impl TaskGraph {
    /// Assemble a graph from subtasks whose ids are unique and whose
    /// dependencies all resolve. Callers validate before calling.
    pub(crate) fn from_validated(goal: &str, complexity: Complexity, subtasks: Vec<Subtask>) -> Self {
        let mut graph = DiGraph::with_capacity(subtasks.len(), subtasks.len());
        let mut index = HashMap::with_capacity(subtasks.len());
        let mut order = Vec::with_capacity(subtasks.len());
        let mut required_workers = BTreeSet::new();

        for subtask in subtasks {
            required_workers.insert(subtask.worker_id.clone());
            order.push(subtask.id.clone());
            let id = subtask.id.clone();
            let node = graph.add_node(subtask);
            index.insert(id, node);
        }

        let edges: Vec<(NodeIndex, NodeIndex)> = graph
            .node_indices()
            .flat_map(|node| {
                graph[node]
                    .dependencies
                    .iter()
                    .filter_map(|dep| index.get(dep).map(|&from| (from, node)))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (from, to) in edges {
            graph.add_edge(from, to, ());
        }

        Self {
            goal: goal.to_string(),
            complexity,
            graph,
            index,
            order,
            mode: ExecutionMode::Sequential,
            total_duration: Duration::ZERO,
            required_workers,
        }
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn complexity(&self) -> Complexity {
        self.complexity
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Critical-path estimate computed at build time.
    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    /// Union of the workers targeted by the subtasks.
    pub fn required_workers(&self) -> &BTreeSet<WorkerId> {
        &self.required_workers
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &SubtaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Subtask ids in declaration order.
    pub fn ids(&self) -> &[SubtaskId] {
        &self.order
    }

    /// Position of a subtask in declaration order.
    pub fn position(&self, id: &SubtaskId) -> Option<usize> {
        self.index.get(id).map(|node| node.index())
    }

    /// Subtasks in declaration order.
    pub fn subtasks(&self) -> impl Iterator<Item = &Subtask> {
        self.order.iter().filter_map(|id| self.get(id))
    }

    pub fn get(&self, id: &SubtaskId) -> Option<&Subtask> {
        self.index.get(id).and_then(|&node| self.graph.node_weight(node))
    }

    pub fn get_mut(&mut self, id: &SubtaskId) -> Option<&mut Subtask> {
        let node = *self.index.get(id)?;
        self.graph.node_weight_mut(node)
    }

    /// Subtasks `id` depends on.
    pub fn dependencies(&self, id: &SubtaskId) -> Vec<&Subtask> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Subtasks that depend on `id`.
    pub fn dependents(&self, id: &SubtaskId) -> Vec<&Subtask> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &SubtaskId, direction: Direction) -> Vec<&Subtask> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<&Subtask> = self
            .graph
            .neighbors_directed(node, direction)
            .filter_map(|n| self.graph.node_weight(n))
            .collect();
        found.sort_by_key(|s| self.position(&s.id));
        found
    }

    /// Roots: subtasks without dependencies.
    pub fn roots(&self) -> Vec<&Subtask> {
        self.subtasks().filter(|s| s.dependencies.is_empty()).collect()
    }

    /// Pending subtasks whose dependencies are all in `completed`.
    pub fn ready_subtasks(&self, completed: &HashSet<SubtaskId>) -> Vec<&Subtask> {
        self.subtasks()
            .filter(|s| s.can_start() && !completed.contains(&s.id))
            .filter(|s| s.dependencies.iter().all(|dep| completed.contains(dep)))
            .collect()
    }

    /// Check if every subtask is in `completed`.
    pub fn all_complete(&self, completed: &HashSet<SubtaskId>) -> bool {
        self.order.iter().all(|id| completed.contains(id))
    }

    /// Number of subtasks not in `completed`.
    pub fn pending_count(&self, completed: &HashSet<SubtaskId>) -> usize {
        self.order.iter().filter(|id| !completed.contains(*id)).count()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for subtask in self.subtasks() {
            match subtask.status {
                SubtaskStatus::Pending => counts.pending += 1,
                SubtaskStatus::Running => counts.running += 1,
                SubtaskStatus::Completed => counts.completed += 1,
                SubtaskStatus::Failed { .. } => counts.failed += 1,
                SubtaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("goal", &self.goal)
            .field("subtasks", &self.len())
            .field("dependencies", &self.graph.edge_count())
            .field("mode", &self.mode)
            .finish()
    }
}
