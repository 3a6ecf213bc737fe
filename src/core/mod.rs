//! Core domain models for orchestration.
//!
//! This module contains the subtask model and the validated task graph
//! the scheduler and orchestrator operate on.

pub mod dag;
pub mod task;

pub use dag::{Complexity, ExecutionMode, StatusCounts, TaskGraph};
pub use task::{Subtask, SubtaskId, SubtaskSpec, SubtaskStatus};
