//! Failure classification for the retry loop.
//!
//! Workers that control their error surface report an explicit
//! [`ErrorType`]. Opaque errors (third-party messages, process stderr) go
//! through [`classify_message`], which is a keyword heuristic and not a
//! guarantee: it inspects the lowercase message in a fixed priority order
//! and the first matching rule wins.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::worker::WorkerError;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    /// Retry-worthy.
    Transient,
    /// Never retried.
    Permanent,
    /// Outside the taxonomy; recorded and surfaced without retry.
    Degraded,
}

impl std::fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorStatus::Transient => write!(f, "transient"),
            ErrorStatus::Permanent => write!(f, "permanent"),
            ErrorStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// The failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Timeout,
    RateLimit,
    ConnectionError,
    AuthError,
    InvalidRequest,
    NotFound,
    ServerError,
    Unknown,
}

impl ErrorType {
    /// The retry status implied by this category.
    pub fn status(&self) -> ErrorStatus {
        match self {
            ErrorType::AuthError | ErrorType::InvalidRequest | ErrorType::NotFound => {
                ErrorStatus::Permanent
            }
            ErrorType::Timeout
            | ErrorType::RateLimit
            | ErrorType::ConnectionError
            | ErrorType::ServerError
            | ErrorType::Unknown => ErrorStatus::Transient,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Timeout => "timeout",
            ErrorType::RateLimit => "rate_limit",
            ErrorType::ConnectionError => "connection_error",
            ErrorType::AuthError => "auth_error",
            ErrorType::InvalidRequest => "invalid_request",
            ErrorType::NotFound => "not_found",
            ErrorType::ServerError => "server_error",
            ErrorType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure with its status and category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub status: ErrorStatus,
    #[serde(rename = "type")]
    pub kind: ErrorType,
}

impl ClassifiedError {
    pub fn new(kind: ErrorType) -> Self {
        Self {
            status: kind.status(),
            kind,
        }
    }

    pub fn degraded() -> Self {
        Self {
            status: ErrorStatus::Degraded,
            kind: ErrorType::Unknown,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.status == ErrorStatus::Transient
    }
}

/// Rules in priority order. Status codes are matched on word boundaries so
/// that e.g. "port 4290" does not read as a rate limit.
fn rules() -> &'static [(ErrorType, Regex)] {
    static RULES: OnceLock<Vec<(ErrorType, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (
                ErrorType::Timeout,
                r"timeout|timed out|deadline exceeded|\b408\b|\b504\b",
            ),
            (
                ErrorType::RateLimit,
                r"rate.?limit|\b429\b|too many requests|quota exceeded|throttl",
            ),
            (
                ErrorType::ConnectionError,
                r"connection|network|unreachable|refused|reset by peer|broken pipe|\bdns\b|\beof\b",
            ),
            (
                ErrorType::AuthError,
                r"\b401\b|\b403\b|unauthori[sz]ed|authenticat|forbidden|permission denied|api key",
            ),
            (
                ErrorType::InvalidRequest,
                r"\b400\b|\b422\b|bad request|invalid request|malformed|invalid argument|validation",
            ),
            (ErrorType::NotFound, r"\b404\b|not found|no such"),
            (
                ErrorType::ServerError,
                r"\b5\d\d\b|server error|internal error|service unavailable|bad gateway|overloaded",
            ),
        ]
        .into_iter()
        .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (kind, re)))
        .collect()
    })
}

/// Heuristically classify an opaque error message.
pub fn classify_message(message: &str) -> ClassifiedError {
    let lower = message.to_lowercase();
    rules()
        .iter()
        .find(|(_, re)| re.is_match(&lower))
        .map(|(kind, _)| ClassifiedError::new(*kind))
        .unwrap_or_else(|| ClassifiedError::new(ErrorType::Unknown))
}

/// Classify a failed worker call.
///
/// Explicit categories are trusted as-is, opaque messages go through the
/// heuristic, and anything outside the taxonomy is degraded.
pub fn classify(err: &WorkerError) -> ClassifiedError {
    match err {
        WorkerError::Classified { kind, .. } => ClassifiedError::new(*kind),
        WorkerError::Opaque(message) => classify_message(message),
        WorkerError::Unexpected(_) => ClassifiedError::degraded(),
    }
}
