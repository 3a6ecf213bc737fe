//! Subtask data model for the task graph.
//!
//! Subtasks are the atomic units of work dispatched to workers. Each
//! subtask tracks its status, target worker, dependencies and result.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::worker::{WorkerId, WorkerResponse};

/// Identifier of a subtask within one task graph.
///
/// Ids are supplied by the decomposition and must be unique per graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubtaskId(pub String);

impl SubtaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubtaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubtaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Subtask status in its lifecycle.
///
/// pending → running → {completed, failed, cancelled}.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SubtaskStatus {
    /// Not yet dispatched.
    #[default]
    Pending,
    /// Dispatched to a worker.
    Running,
    /// Worker returned a successful result.
    Completed,
    /// Worker call failed after the resilience layer gave up.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Stopped by a client cancel before or during dispatch.
    Cancelled,
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubtaskStatus::Pending => write!(f, "pending"),
            SubtaskStatus::Running => write!(f, "running"),
            SubtaskStatus::Completed => write!(f, "completed"),
            SubtaskStatus::Failed { error } => write!(f, "failed: {}", error),
            SubtaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Input form of a subtask, as produced by a decomposer or a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub id: SubtaskId,
    pub description: String,
    pub worker_id: WorkerId,
    /// Lower values run first when ordering is otherwise free.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<SubtaskId>,
    /// Estimated duration in seconds.
    #[serde(default, with = "duration_secs")]
    pub estimated_duration: Duration,
}

impl SubtaskSpec {
    pub fn new(
        id: impl Into<SubtaskId>,
        description: impl Into<String>,
        worker_id: impl Into<WorkerId>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            worker_id: worker_id.into(),
            priority: 0,
            dependencies: Vec::new(),
            estimated_duration: Duration::ZERO,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: impl Into<SubtaskId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }
}

/// A single node in the task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique identifier within the graph.
    pub id: SubtaskId,
    /// What the worker is asked to do.
    pub description: String,
    /// Worker the subtask is dispatched to.
    pub worker_id: WorkerId,
    /// Tie-break for ordering. Lower runs first.
    pub priority: i32,
    /// Ids that must complete before this subtask may run.
    pub dependencies: BTreeSet<SubtaskId>,
    #[serde(with = "duration_secs")]
    pub estimated_duration: Duration,
    /// Current execution status.
    pub status: SubtaskStatus,
    /// Worker result once finished.
    pub result: Option<WorkerResponse>,
    /// When the subtask was dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the subtask reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Subtask {
    pub fn from_spec(spec: SubtaskSpec) -> Self {
        Self {
            id: spec.id,
            description: spec.description,
            worker_id: spec.worker_id,
            priority: spec.priority,
            dependencies: spec.dependencies.into_iter().collect(),
            estimated_duration: spec.estimated_duration,
            status: SubtaskStatus::Pending,
            result: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Transition to Running and record the start time.
    pub fn start(&mut self) {
        self.status = SubtaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Transition to Completed with the worker's result.
    pub fn complete(&mut self, result: WorkerResponse) {
        self.status = SubtaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    /// Transition to Failed. The structured result is kept when there is one.
    pub fn fail(&mut self, error: &str, result: Option<WorkerResponse>) {
        self.status = SubtaskStatus::Failed {
            error: error.to_string(),
        };
        self.result = result;
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = SubtaskStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Check if the subtask is in a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            SubtaskStatus::Completed | SubtaskStatus::Failed { .. } | SubtaskStatus::Cancelled
        )
    }

    /// Check if the subtask can still be dispatched.
    pub fn can_start(&self) -> bool {
        self.status == SubtaskStatus::Pending
    }

    pub fn is_completed(&self) -> bool {
        self.status == SubtaskStatus::Completed
    }
}

/// Serialize a `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {}",
                secs
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
