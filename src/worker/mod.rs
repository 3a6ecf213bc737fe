//! The worker contract.
//!
//! A worker is an opaque callable unit: it accepts a [`WorkerRequest`] and
//! returns a [`WorkerResponse`]. The orchestration core never looks inside
//! a worker; it only relies on this trait, the worker's identifier and its
//! advertised capabilities.

pub mod capability;
pub mod command;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::resilience::ErrorType;

pub use capability::{CapabilitySet, CapabilityShape};
pub use command::{CommandWorker, CommandWorkerConfig, CONTEXT_ENV_VAR};

/// Identifier a worker is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Instruction plus free-form context handed to a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub instruction: String,
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

impl WorkerRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Outcome reported by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    PartialSuccess,
    Cancelled,
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseStatus::Success => write!(f, "success"),
            ResponseStatus::Error => write!(f, "error"),
            ResponseStatus::PartialSuccess => write!(f, "partial_success"),
            ResponseStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Structured result of one worker call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub status: ResponseStatus,
    pub content: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Explicit failure category for `status == Error`, when the worker knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
}

impl WorkerResponse {
    pub fn success(content: impl Into<Value>) -> Self {
        Self {
            status: ResponseStatus::Success,
            content: content.into(),
            metadata: HashMap::new(),
            error_type: None,
        }
    }

    pub fn partial(content: impl Into<Value>) -> Self {
        Self {
            status: ResponseStatus::PartialSuccess,
            ..Self::success(content)
        }
    }

    pub fn error(message: impl Into<String>, error_type: Option<ErrorType>) -> Self {
        Self {
            status: ResponseStatus::Error,
            content: Value::String(message.into()),
            metadata: HashMap::new(),
            error_type,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Cancelled,
            content: Value::String(message.into()),
            metadata: HashMap::new(),
            error_type: None,
        }
    }

    /// Convert an orchestration error into the structured result that
    /// crosses the registry boundary.
    pub fn from_error(err: &Error) -> Self {
        let mut response = match err {
            Error::Cancelled(reason) => Self::cancelled(reason.clone()),
            Error::TransientFailure { kind, .. } | Error::PermanentFailure { kind, .. } => {
                Self::error(err.to_string(), Some(*kind))
            }
            _ => Self::error(err.to_string(), None),
        };
        response
            .metadata
            .insert("error".to_string(), Value::String(err.kind().to_string()));
        if let Error::TransientFailure { attempts, .. } = err {
            response
                .metadata
                .insert("attempts".to_string(), Value::from(*attempts));
        }
        response
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            ResponseStatus::Success | ResponseStatus::PartialSuccess
        )
    }

    /// The content as text: strings verbatim, anything else as JSON.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A failed worker call as seen by the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerError {
    /// The worker knows what went wrong.
    Classified { kind: ErrorType, message: String },
    /// An opaque message; classified heuristically.
    Opaque(String),
    /// Contract violations and panics. Never retried.
    Unexpected(String),
}

impl WorkerError {
    pub fn classified(kind: ErrorType, message: impl Into<String>) -> Self {
        Self::Classified {
            kind,
            message: message.into(),
        }
    }

    pub fn opaque(message: impl Into<String>) -> Self {
        Self::Opaque(message.into())
    }

    pub fn message(&self) -> &str {
        match self {
            WorkerError::Classified { message, .. } => message,
            WorkerError::Opaque(message) | WorkerError::Unexpected(message) => message,
        }
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Classified { kind, message } => write!(f, "{}: {}", kind, message),
            WorkerError::Opaque(message) => f.write_str(message),
            WorkerError::Unexpected(message) => write!(f, "unexpected: {}", message),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<WorkerResponse> for WorkerError {
    /// An `error` response counts as a failed attempt.
    fn from(response: WorkerResponse) -> Self {
        let message = response.content_text();
        match response.error_type {
            Some(kind) => WorkerError::Classified { kind, message },
            None => WorkerError::Opaque(message),
        }
    }
}

/// An opaque unit of work.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Identifier used at registration.
    fn id(&self) -> WorkerId;

    /// Advertised capabilities in whichever shape the worker reports.
    fn capabilities(&self) -> CapabilityShape;

    /// Run one instruction.
    async fn execute(
        &self,
        request: WorkerRequest,
    ) -> std::result::Result<WorkerResponse, WorkerError>;

    /// Release resources. Called once by `WorkerRegistry::shutdown`.
    async fn shutdown(&self) {}
}
