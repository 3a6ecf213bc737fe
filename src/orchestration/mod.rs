//! Orchestration layer for Conductor.
//!
//! This module turns goals into task graphs, routes subtasks to registered
//! workers through per-worker resilience, and drives graph execution in
//! dependency order.

pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod scheduler;

pub use orchestrator::{
    run_specs, ExecutionOutcome, ExecutionReport, Orchestrator, OrchestratorEvent, SubtaskResult,
};
pub use planner::{plan_goal, Decomposer, TemplateDecomposer};
pub use registry::{
    Dispatched, RegistryConfig, RegistryEvent, WorkerInfo, WorkerRegistry, WorkerStatus,
    DEFAULT_MAX_CONCURRENT_PER_WORKER,
};
pub use scheduler::{PlanSummary, TaskGraphScheduler};
