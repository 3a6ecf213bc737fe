//! Task graph construction and scheduling analysis.
//!
//! `TaskGraphScheduler` turns a decomposition (a list of [`SubtaskSpec`])
//! into a validated [`TaskGraph`] and answers the questions the
//! orchestrator needs before running it: the execution levels, the
//! critical-path duration, the execution mode, and a priority-aware
//! topological order.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::dag::{Complexity, ExecutionMode, TaskGraph};
use crate::core::task::{duration_secs, Subtask, SubtaskId, SubtaskSpec};
use crate::error::{Error, Result};
use crate::worker::WorkerId;

/// Serializable overview of a built graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub goal: String,
    pub complexity: Complexity,
    pub mode: ExecutionMode,
    /// Subtask ids per level, each level in declaration order.
    pub levels: Vec<Vec<SubtaskId>>,
    /// Order used in sequential mode.
    pub order: Vec<SubtaskId>,
    #[serde(with = "duration_secs")]
    pub critical_path: Duration,
    pub required_workers: Vec<WorkerId>,
}

/// Stateless graph builder and analyzer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskGraphScheduler;

impl TaskGraphScheduler {
    /// Validate `specs` and build the graph.
    ///
    /// The execution mode and the total (critical-path) duration are
    /// computed once here and stored on the graph.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decomposition` for an empty list, duplicate ids,
    /// dependencies on unknown ids, or a dependency cycle.
    pub fn build(goal: &str, complexity: Complexity, specs: Vec<SubtaskSpec>) -> Result<TaskGraph> {
        Self::validate(&specs)?;

        let subtasks: Vec<Subtask> = specs.into_iter().map(Subtask::from_spec).collect();
        let mut graph = TaskGraph::from_validated(goal, complexity, subtasks);
        graph.mode = Self::execution_mode(&graph);
        graph.total_duration = Self::critical_path_duration(&graph);

        debug!(
            goal = %goal,
            subtasks = graph.len(),
            mode = %graph.mode(),
            critical_path = ?graph.total_duration(),
            "task graph built"
        );
        Ok(graph)
    }

    /// Check a decomposition without building a graph.
    pub fn validate(specs: &[SubtaskSpec]) -> Result<()> {
        if specs.is_empty() {
            return Err(Error::Decomposition("decomposition produced no subtasks".to_string()));
        }

        let mut seen = HashSet::with_capacity(specs.len());
        for spec in specs {
            if !seen.insert(&spec.id) {
                return Err(Error::Decomposition(format!("duplicate subtask id: {}", spec.id)));
            }
        }

        for spec in specs {
            if let Some(missing) = spec.dependencies.iter().find(|dep| !seen.contains(dep)) {
                return Err(Error::Decomposition(format!(
                    "subtask {} depends on unknown subtask {}",
                    spec.id, missing
                )));
            }
        }

        // Kahn's algorithm: whatever cannot be peeled off sits on a cycle
        // or downstream of one.
        let index: HashMap<&SubtaskId, usize> =
            specs.iter().enumerate().map(|(i, s)| (&s.id, i)).collect();
        let mut indegree = vec![0usize; specs.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            let deps: BTreeSet<&SubtaskId> = spec.dependencies.iter().collect();
            indegree[i] = deps.len();
            for dep in deps {
                dependents[index[dep]].push(i);
            }
        }

        let mut queue: Vec<usize> = (0..specs.len()).filter(|&i| indegree[i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = queue.pop() {
            visited += 1;
            for &next in &dependents[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push(next);
                }
            }
        }

        if visited < specs.len() {
            let stuck: Vec<&str> = specs
                .iter()
                .enumerate()
                .filter(|(i, _)| indegree[*i] > 0)
                .map(|(_, s)| s.id.as_str())
                .collect();
            return Err(Error::Decomposition(format!(
                "dependency cycle among subtasks: {}",
                stuck.join(", ")
            )));
        }

        Ok(())
    }

    /// Group subtasks into levels.
    ///
    /// A subtask without dependencies is at level 0; any other is one
    /// above its deepest dependency. Levels are computed once per subtask
    /// in topological order.
    pub fn levels(graph: &TaskGraph) -> Vec<BTreeSet<SubtaskId>> {
        let depth = Self::depths(graph);
        let mut levels: Vec<BTreeSet<SubtaskId>> = Vec::new();
        for id in graph.ids() {
            let Some(&level) = depth.get(id) else {
                continue;
            };
            if levels.len() <= level {
                levels.resize_with(level + 1, BTreeSet::new);
            }
            levels[level].insert(id.clone());
        }
        levels
    }

    /// Same as [`levels`](Self::levels) with each level in declaration order.
    pub fn ordered_levels(graph: &TaskGraph) -> Vec<Vec<SubtaskId>> {
        Self::levels(graph)
            .into_iter()
            .map(|level| {
                let mut ids: Vec<SubtaskId> = level.into_iter().collect();
                ids.sort_by_key(|id| graph.position(id));
                ids
            })
            .collect()
    }

    fn depths(graph: &TaskGraph) -> HashMap<SubtaskId, usize> {
        let mut depth: HashMap<SubtaskId, usize> = HashMap::with_capacity(graph.len());
        for id in Self::execution_order(graph) {
            let Some(subtask) = graph.get(&id) else {
                continue;
            };
            let level = subtask
                .dependencies
                .iter()
                .filter_map(|dep| depth.get(dep))
                .max()
                .map_or(0, |deepest| deepest + 1);
            depth.insert(id, level);
        }
        depth
    }

    /// Estimated wall-clock duration.
    ///
    /// Parallel graphs take the longest dependency chain (sum of estimates
    /// along the path); sequential graphs take the sum of all estimates.
    pub fn critical_path_duration(graph: &TaskGraph) -> Duration {
        match graph.mode() {
            ExecutionMode::Sequential => graph.subtasks().map(|s| s.estimated_duration).sum(),
            ExecutionMode::Parallel => {
                let mut finish: HashMap<SubtaskId, Duration> = HashMap::with_capacity(graph.len());
                for id in Self::execution_order(graph) {
                    let Some(subtask) = graph.get(&id) else {
                        continue;
                    };
                    let start = subtask
                        .dependencies
                        .iter()
                        .filter_map(|dep| finish.get(dep))
                        .max()
                        .copied()
                        .unwrap_or(Duration::ZERO);
                    finish.insert(id, start + subtask.estimated_duration);
                }
                finish.into_values().max().unwrap_or(Duration::ZERO)
            }
        }
    }

    /// Parallel when there is more than one level or more than one root.
    pub fn execution_mode(graph: &TaskGraph) -> ExecutionMode {
        if Self::levels(graph).len() > 1 || graph.roots().len() > 1 {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        }
    }

    /// Topological order with ties broken by priority, then declaration
    /// order. Lower priority values run first.
    pub fn execution_order(graph: &TaskGraph) -> Vec<SubtaskId> {
        let ids = graph.ids();
        let position: HashMap<&SubtaskId, usize> =
            ids.iter().enumerate().map(|(i, id)| (id, i)).collect();

        let mut indegree = vec![0usize; ids.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
        let mut priority = vec![0i32; ids.len()];
        for (i, subtask) in graph.subtasks().enumerate() {
            priority[i] = subtask.priority;
            for dep in &subtask.dependencies {
                if let Some(&d) = position.get(dep) {
                    indegree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }

        let mut heap: BinaryHeap<Reverse<(i32, usize)>> = (0..ids.len())
            .filter(|&i| indegree[i] == 0)
            .map(|i| Reverse((priority[i], i)))
            .collect();
        let mut order = Vec::with_capacity(ids.len());
        while let Some(Reverse((_, i))) = heap.pop() {
            order.push(ids[i].clone());
            for &next in &dependents[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    heap.push(Reverse((priority[next], next)));
                }
            }
        }
        order
    }

    pub fn summarize(graph: &TaskGraph) -> PlanSummary {
        PlanSummary {
            goal: graph.goal().to_string(),
            complexity: graph.complexity(),
            mode: graph.mode(),
            levels: Self::ordered_levels(graph),
            order: Self::execution_order(graph),
            critical_path: graph.total_duration(),
            required_workers: graph.required_workers().iter().cloned().collect(),
        }
    }
}
