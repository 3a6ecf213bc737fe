//! Graph execution.
//!
//! The `Orchestrator` runs a validated [`TaskGraph`] against the
//! [`WorkerRegistry`]. Sequential graphs run one subtask at a time in
//! priority-aware topological order and stop at the first failure.
//! Parallel graphs run level by level: every ready subtask of a level is
//! dispatched concurrently and the level completes when all of them have
//! returned. Failures inside a level are isolated; their dependents are
//! skipped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::dag::{Complexity, ExecutionMode, TaskGraph};
use crate::core::task::{duration_secs, SubtaskId, SubtaskSpec, SubtaskStatus};
use crate::error::Result;
use crate::orchestration::registry::{Dispatched, WorkerRegistry};
use crate::orchestration::scheduler::TaskGraphScheduler;
use crate::session::CancelToken;
use crate::worker::{ResponseStatus, WorkerId, WorkerRequest, WorkerResponse};

/// Events emitted while a graph runs.
///
/// These allow external components (the control channel, the CLI) to
/// report progress without polling the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    /// Execution began.
    Started {
        run_id: Uuid,
        mode: ExecutionMode,
        subtasks: usize,
    },
    /// A parallel level is about to be dispatched.
    LevelStarted { level: usize, subtasks: Vec<SubtaskId> },
    /// A subtask was dispatched.
    SubtaskStarted {
        subtask_id: SubtaskId,
        worker_id: WorkerId,
    },
    SubtaskCompleted {
        subtask_id: SubtaskId,
        worker_id: WorkerId,
    },
    SubtaskFailed { subtask_id: SubtaskId, error: String },
    SubtaskCancelled { subtask_id: SubtaskId },
    /// A subtask was never dispatched.
    SubtaskSkipped { subtask_id: SubtaskId, reason: String },
    /// Every subtask of a parallel level has returned.
    LevelCompleted { level: usize },
    /// Execution ended.
    Finished { outcome: ExecutionOutcome },
}

impl OrchestratorEvent {
    /// One-line human-readable description, used for progress messages.
    pub fn describe(&self) -> String {
        match self {
            OrchestratorEvent::Started { mode, subtasks, .. } => {
                format!("Running {} subtask(s) in {} mode", subtasks, mode)
            }
            OrchestratorEvent::LevelStarted { level, subtasks } => {
                format!("Level {}: dispatching {} subtask(s)", level, subtasks.len())
            }
            OrchestratorEvent::SubtaskStarted {
                subtask_id,
                worker_id,
            } => format!("Started {} on {}", subtask_id, worker_id),
            OrchestratorEvent::SubtaskCompleted { subtask_id, .. } => {
                format!("Completed {}", subtask_id)
            }
            OrchestratorEvent::SubtaskFailed { subtask_id, error } => {
                format!("Failed {}: {}", subtask_id, error)
            }
            OrchestratorEvent::SubtaskCancelled { subtask_id } => format!("Cancelled {}", subtask_id),
            OrchestratorEvent::SubtaskSkipped { subtask_id, reason } => {
                format!("Skipped {}: {}", subtask_id, reason)
            }
            OrchestratorEvent::LevelCompleted { level } => format!("Level {} complete", level),
            OrchestratorEvent::Finished { outcome } => format!("Finished: {}", outcome),
        }
    }
}

/// Overall result of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    PartiallyFailed,
    Cancelled,
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionOutcome::Completed => write!(f, "completed"),
            ExecutionOutcome::PartiallyFailed => write!(f, "partially_failed"),
            ExecutionOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of one dispatched subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub subtask_id: SubtaskId,
    /// The worker that handled the subtask (after any fallback).
    pub worker_id: WorkerId,
    pub status: SubtaskStatus,
    pub response: WorkerResponse,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Everything known about a finished execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    pub goal: String,
    pub mode: ExecutionMode,
    pub outcome: ExecutionOutcome,
    /// Dispatched subtasks in completion order.
    pub results: Vec<SubtaskResult>,
    /// Subtasks that were never dispatched.
    pub skipped: Vec<SubtaskId>,
    /// Failure marker for partially failed or cancelled runs.
    pub error: Option<String>,
    #[serde(with = "duration_secs")]
    pub critical_path: Duration,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Completed
    }

    pub fn result(&self, id: &SubtaskId) -> Option<&SubtaskResult> {
        self.results.iter().find(|r| &r.subtask_id == id)
    }

    /// Content of every completed subtask, in completion order.
    pub fn combined_content(&self) -> String {
        let completed: Vec<&SubtaskResult> = self
            .results
            .iter()
            .filter(|r| r.status == SubtaskStatus::Completed)
            .collect();
        match completed.as_slice() {
            [only] => only.response.content_text(),
            many => many
                .iter()
                .map(|r| format!("[{}]\n{}", r.subtask_id, r.response.content_text()))
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

/// A subtask ready to be sent to a worker.
struct Job {
    subtask_id: SubtaskId,
    worker_id: WorkerId,
    request: WorkerRequest,
}

/// Runs task graphs against a worker registry.
pub struct Orchestrator {
    registry: Arc<WorkerRegistry>,
    event_tx: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl Orchestrator {
    pub fn new(registry: Arc<WorkerRegistry>) -> Self {
        Self {
            registry,
            event_tx: None,
        }
    }

    /// Emit execution events on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Run every subtask of `graph` and report the outcome.
    ///
    /// Subtask statuses and results are written back into `graph`. Never
    /// fails: worker failures, skipped subtasks and cancellation are all
    /// described by the returned report.
    pub async fn execute(&self, graph: &mut TaskGraph, cancel: &CancelToken) -> ExecutionReport {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let mode = graph.mode();
        info!(run = %run_id, goal = %graph.goal(), mode = %mode, subtasks = graph.len(), "execution started");
        self.emit(OrchestratorEvent::Started {
            run_id,
            mode,
            subtasks: graph.len(),
        });

        let mut run = RunState::default();
        match mode {
            ExecutionMode::Sequential => self.run_sequential(graph, cancel, &mut run).await,
            ExecutionMode::Parallel => self.run_parallel(graph, cancel, &mut run).await,
        }

        let outcome = if run.cancelled || cancel.is_cancelled() {
            ExecutionOutcome::Cancelled
        } else if run.failed.is_empty() && run.skipped.is_empty() {
            ExecutionOutcome::Completed
        } else {
            ExecutionOutcome::PartiallyFailed
        };
        let error = match outcome {
            ExecutionOutcome::Completed => None,
            ExecutionOutcome::Cancelled => Some("execution cancelled".to_string()),
            ExecutionOutcome::PartiallyFailed => Some(run.failure_marker()),
        };

        info!(run = %run_id, outcome = %outcome, elapsed = ?started.elapsed(), "execution finished");
        self.emit(OrchestratorEvent::Finished { outcome });

        ExecutionReport {
            run_id,
            goal: graph.goal().to_string(),
            mode,
            outcome,
            results: run.results,
            skipped: run.skipped,
            error,
            critical_path: graph.total_duration(),
            elapsed: started.elapsed(),
        }
    }

    async fn run_sequential(&self, graph: &mut TaskGraph, cancel: &CancelToken, run: &mut RunState) {
        let order = TaskGraphScheduler::execution_order(graph);
        for (position, id) in order.iter().enumerate() {
            if cancel.is_cancelled() {
                run.cancelled = true;
                self.skip_all(&order[position..], "execution cancelled", run);
                return;
            }
            let Some(job) = self.prepare(graph, id) else {
                continue;
            };
            let dispatched = self
                .registry
                .try_dispatch(&job.worker_id, job.request.clone(), cancel)
                .await;
            let status = self.apply(graph, job, dispatched, run);
            if !matches!(status, SubtaskStatus::Completed) {
                // No rollback: earlier results stand.
                self.skip_all(&order[position + 1..], "an earlier subtask did not complete", run);
                return;
            }
        }
    }

    async fn run_parallel(&self, graph: &mut TaskGraph, cancel: &CancelToken, run: &mut RunState) {
        let levels = TaskGraphScheduler::ordered_levels(graph);
        let mut completed: HashSet<SubtaskId> = HashSet::new();

        for (level, ids) in levels.iter().enumerate() {
            if cancel.is_cancelled() {
                run.cancelled = true;
                let rest: Vec<SubtaskId> = levels[level..].iter().flatten().cloned().collect();
                self.skip_all(&rest, "execution cancelled", run);
                return;
            }

            let mut jobs = Vec::with_capacity(ids.len());
            for id in ids {
                let ready = graph
                    .get(id)
                    .is_some_and(|s| s.dependencies.iter().all(|dep| completed.contains(dep)));
                if !ready {
                    self.skip(id, "a dependency did not complete", run);
                    continue;
                }
                if let Some(job) = self.prepare(graph, id) {
                    jobs.push(job);
                }
            }
            if jobs.is_empty() {
                continue;
            }

            self.emit(OrchestratorEvent::LevelStarted {
                level,
                subtasks: jobs.iter().map(|j| j.subtask_id.clone()).collect(),
            });
            debug!(level, subtasks = jobs.len(), "dispatching level");

            let outcomes = join_all(jobs.iter().map(|job| {
                self.registry
                    .try_dispatch(&job.worker_id, job.request.clone(), cancel)
            }))
            .await;

            for (job, dispatched) in jobs.into_iter().zip(outcomes) {
                let id = job.subtask_id.clone();
                if self.apply(graph, job, dispatched, run) == SubtaskStatus::Completed {
                    completed.insert(id);
                }
            }
            self.emit(OrchestratorEvent::LevelCompleted { level });
        }
    }

    /// Mark a subtask running and build its request.
    fn prepare(&self, graph: &mut TaskGraph, id: &SubtaskId) -> Option<Job> {
        let dependencies: serde_json::Map<String, Value> = graph
            .dependencies(id)
            .into_iter()
            .filter_map(|dep| {
                dep.result
                    .as_ref()
                    .map(|r| (dep.id.to_string(), r.content.clone()))
            })
            .collect();

        let goal = graph.goal().to_string();
        let subtask = graph.get_mut(id)?;
        if !subtask.can_start() {
            return None;
        }
        subtask.start();

        let mut request = WorkerRequest::new(subtask.description.clone())
            .with_context("goal", Value::String(goal))
            .with_context("subtask_id", Value::String(id.to_string()));
        if !dependencies.is_empty() {
            request = request.with_context("dependencies", Value::Object(dependencies));
        }

        self.emit(OrchestratorEvent::SubtaskStarted {
            subtask_id: id.clone(),
            worker_id: subtask.worker_id.clone(),
        });
        Some(Job {
            subtask_id: id.clone(),
            worker_id: subtask.worker_id.clone(),
            request,
        })
    }

    /// Record a dispatch outcome on the graph and in the run state.
    fn apply(
        &self,
        graph: &mut TaskGraph,
        job: Job,
        dispatched: Result<Dispatched>,
        run: &mut RunState,
    ) -> SubtaskStatus {
        let Some(subtask) = graph.get_mut(&job.subtask_id) else {
            return SubtaskStatus::Pending;
        };

        let (worker_id, response) = match dispatched {
            Ok(Dispatched {
                worker_id,
                response,
                ..
            }) => {
                if response.status == ResponseStatus::Cancelled {
                    subtask.cancel();
                } else {
                    subtask.complete(response.clone());
                }
                (worker_id, response)
            }
            Err(err) => {
                let response = WorkerResponse::from_error(&err);
                if err.is_cancelled() {
                    subtask.cancel();
                } else {
                    subtask.fail(&err.to_string(), Some(response.clone()));
                }
                (job.worker_id.clone(), response)
            }
        };

        let status = subtask.status.clone();
        match &status {
            SubtaskStatus::Completed => {
                debug!(subtask = %job.subtask_id, worker = %worker_id, "subtask completed");
                self.emit(OrchestratorEvent::SubtaskCompleted {
                    subtask_id: job.subtask_id.clone(),
                    worker_id: worker_id.clone(),
                });
            }
            SubtaskStatus::Failed { error } => {
                warn!(subtask = %job.subtask_id, worker = %worker_id, "subtask failed: {}", error);
                run.failed.push((job.subtask_id.clone(), error.clone()));
                self.emit(OrchestratorEvent::SubtaskFailed {
                    subtask_id: job.subtask_id.clone(),
                    error: error.clone(),
                });
            }
            SubtaskStatus::Cancelled => {
                debug!(subtask = %job.subtask_id, "subtask cancelled");
                run.cancelled = true;
                self.emit(OrchestratorEvent::SubtaskCancelled {
                    subtask_id: job.subtask_id.clone(),
                });
            }
            SubtaskStatus::Pending | SubtaskStatus::Running => {}
        }

        run.results.push(SubtaskResult {
            subtask_id: job.subtask_id,
            worker_id,
            status: status.clone(),
            response,
            started_at: subtask.started_at,
            completed_at: subtask.completed_at,
        });
        status
    }

    fn skip(&self, id: &SubtaskId, reason: &str, run: &mut RunState) {
        debug!(subtask = %id, "skipping subtask: {}", reason);
        run.skipped.push(id.clone());
        self.emit(OrchestratorEvent::SubtaskSkipped {
            subtask_id: id.clone(),
            reason: reason.to_string(),
        });
    }

    fn skip_all(&self, ids: &[SubtaskId], reason: &str, run: &mut RunState) {
        for id in ids {
            self.skip(id, reason, run);
        }
    }
}

#[derive(Default)]
struct RunState {
    results: Vec<SubtaskResult>,
    skipped: Vec<SubtaskId>,
    failed: Vec<(SubtaskId, String)>,
    cancelled: bool,
}

impl RunState {
    fn failure_marker(&self) -> String {
        match self.failed.as_slice() {
            [] => format!("{} subtask(s) skipped", self.skipped.len()),
            [(id, error)] => format!("subtask {} failed: {}", id, error),
            many => {
                let ids: Vec<&str> = many.iter().map(|(id, _)| id.as_str()).collect();
                format!("{} subtasks failed: {}", many.len(), ids.join(", "))
            }
        }
    }
}

/// Build, run and report in one call. Decomposition errors are returned
/// before anything is dispatched.
pub async fn run_specs(
    orchestrator: &Orchestrator,
    goal: &str,
    complexity: Complexity,
    specs: Vec<SubtaskSpec>,
    cancel: &CancelToken,
) -> Result<(TaskGraph, ExecutionReport)> {
    let mut graph = TaskGraphScheduler::build(goal, complexity, specs)?;
    let report = orchestrator.execute(&mut graph, cancel).await;
    Ok((graph, report))
}
