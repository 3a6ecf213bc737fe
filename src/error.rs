use std::time::Duration;

use thiserror::Error;

use crate::resilience::ErrorType;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Decomposition error: {0}")]
    Decomposition(String),

    #[error("Transient failure after {attempts} attempt(s) ({kind}): {message}")]
    TransientFailure {
        attempts: u32,
        kind: ErrorType,
        message: String,
    },

    #[error("Permanent failure ({kind}): {message}")]
    PermanentFailure { kind: ErrorType, message: String },

    #[error("Degraded failure: {0}")]
    Degraded(String),

    #[error("Circuit breaker open for {name} (retry in {retry_in:?})")]
    CircuitOpen { name: String, retry_in: Duration },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Worker registry is shut down")]
    RegistryClosed,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already running: {0}")]
    SessionExists(String),

    #[error("Session already completed: {0}")]
    SessionCompleted(String),
}

impl Error {
    /// Stable snake_case tag used on the control channel and in response metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::TomlParse(_) | Error::TomlSerialize(_) => "config",
            Error::NoHomeDir => "no_home_dir",
            Error::Validation(_) => "validation",
            Error::Decomposition(_) => "decomposition",
            Error::TransientFailure { .. } => "transient_failure",
            Error::PermanentFailure { .. } => "permanent_failure",
            Error::Degraded(_) => "degraded",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::Cancelled(_) => "cancelled",
            Error::TaskJoin(_) => "task_join",
            Error::WorkerNotFound(_) => "worker_not_found",
            Error::RegistryClosed => "registry_closed",
            Error::SessionNotFound(_) => "session_not_found",
            Error::SessionExists(_) => "session_exists",
            Error::SessionCompleted(_) => "session_completed",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
