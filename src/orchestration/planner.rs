//! Goal decomposition.
//!
//! A [`Decomposer`] turns a goal into subtask specs. The shipped
//! [`TemplateDecomposer`] does no language work: simple goals become a
//! single subtask on the default worker, larger goals are expanded from the
//! configured stage templates, each stage routed to a worker by capability.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::config::{PlanConfig, StageTemplate};
use crate::core::dag::{Complexity, TaskGraph};
use crate::core::task::SubtaskSpec;
use crate::error::{Error, Result};
use crate::orchestration::registry::WorkerRegistry;
use crate::orchestration::scheduler::TaskGraphScheduler;
use crate::worker::WorkerId;

/// Estimate used for the single subtask of a simple goal.
pub const SIMPLE_ESTIMATE_SECS: u64 = 60;

/// Id of the single subtask of a simple goal.
pub const SIMPLE_SUBTASK_ID: &str = "task";

/// Turns a goal into subtask specs.
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, goal: &str, complexity: Complexity) -> Result<Vec<SubtaskSpec>>;
}

/// Template-driven decomposer backed by the worker registry.
pub struct TemplateDecomposer {
    registry: Arc<WorkerRegistry>,
    plan: PlanConfig,
}

impl TemplateDecomposer {
    pub fn new(registry: Arc<WorkerRegistry>, plan: PlanConfig) -> Self {
        Self { registry, plan }
    }

    /// The configured default worker, else the first registered one.
    fn fallback_worker(&self) -> Result<WorkerId> {
        self.registry
            .default_worker()
            .cloned()
            .or_else(|| self.registry.worker_ids().into_iter().next())
            .ok_or_else(|| Error::Decomposition("no worker available to run the goal".to_string()))
    }

    fn stage_worker(&self, stage: &StageTemplate) -> Result<WorkerId> {
        match self.registry.find_by_capability(&stage.capability) {
            Some(id) => Ok(id),
            None => {
                debug!(stage = %stage.name, capability = %stage.capability, "no worker with capability, using fallback");
                self.fallback_worker()
            }
        }
    }

    fn single(&self, goal: &str) -> Result<Vec<SubtaskSpec>> {
        Ok(vec![SubtaskSpec::new(SIMPLE_SUBTASK_ID, goal, self.fallback_worker()?)
            .with_duration(Duration::from_secs(SIMPLE_ESTIMATE_SECS))])
    }
}

#[async_trait]
impl Decomposer for TemplateDecomposer {
    async fn decompose(&self, goal: &str, complexity: Complexity) -> Result<Vec<SubtaskSpec>> {
        if goal.trim().is_empty() {
            return Err(Error::Decomposition("goal is empty".to_string()));
        }
        let stages = match complexity {
            Complexity::Simple => return self.single(goal),
            Complexity::Medium => &self.plan.medium,
            Complexity::Complex => &self.plan.complex,
        };
        if stages.is_empty() {
            return self.single(goal);
        }

        let mut specs = Vec::with_capacity(stages.len());
        for stage in stages {
            let mut spec = SubtaskSpec::new(
                stage.name.as_str(),
                stage.instruction.replace("{goal}", goal),
                self.stage_worker(stage)?,
            )
            .with_priority(stage.priority)
            .with_duration(Duration::from_secs(stage.estimated_secs));
            for dep in &stage.depends_on {
                spec = spec.depends_on(dep.as_str());
            }
            specs.push(spec);
        }
        debug!(complexity = %complexity, subtasks = specs.len(), "goal decomposed from templates");
        Ok(specs)
    }
}

/// Decompose `goal` and build its graph. Complexity is assessed from the
/// goal text when not given.
pub async fn plan_goal(
    decomposer: &dyn Decomposer,
    goal: &str,
    complexity: Option<Complexity>,
) -> Result<TaskGraph> {
    let complexity = complexity.unwrap_or_else(|| Complexity::assess(goal));
    let specs = decomposer.decompose(goal, complexity).await?;
    TaskGraphScheduler::build(goal, complexity, specs)
}
