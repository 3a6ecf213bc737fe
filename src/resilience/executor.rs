//! Retry loop with per-attempt timeout and a circuit breaker.
//!
//! One `ResilientExecutor` guards one dependency (typically one worker).
//! Each call is admitted by the breaker, attempted up to
//! `RetryPolicy::max_retries` times with exponential backoff between
//! transient failures, and settled with exactly one breaker update.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use super::classify::{classify, ErrorStatus, ErrorType};
use crate::error::{Error, Result};
use crate::session::CancelToken;
use crate::worker::WorkerError;

/// Default number of attempts per call.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the second attempt.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;

/// Default growth factor between attempts.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default cap on any single backoff delay.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Default bound on one attempt, independent of any worker-internal timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 120;

/// How a call is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 are treated as 1.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            attempt_timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based):
    /// `min(initial * multiplier^(attempt-1), max_backoff)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_backoff
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

/// Timeout, retry and circuit-breaker shield around an operation.
#[derive(Debug)]
pub struct ResilientExecutor {
    name: String,
    policy: RetryPolicy,
    breaker: Mutex<CircuitBreaker>,
}

impl ResilientExecutor {
    pub fn new(name: impl Into<String>, policy: RetryPolicy, breaker: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            policy,
            breaker: Mutex::new(CircuitBreaker::new(breaker)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn failure_count(&self) -> u32 {
        self.breaker().failure_count()
    }

    pub fn is_available(&self) -> bool {
        self.breaker().is_available()
    }

    pub fn breaker_snapshot(&self) -> CircuitSnapshot {
        self.breaker().snapshot()
    }

    fn breaker(&self) -> MutexGuard<'_, CircuitBreaker> {
        // Breaker updates are single assignments; a poisoned lock still
        // holds consistent state.
        self.breaker.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `operation` under the retry policy and breaker.
    ///
    /// `operation` receives the 1-based attempt number. Cancellation is
    /// checked before the first attempt and after every backoff wait; an
    /// attempt already in flight is never interrupted except by its timeout.
    ///
    /// # Errors
    ///
    /// - `Error::Cancelled` if `cancel` fires before or between attempts
    /// - `Error::CircuitOpen` if the breaker rejects the call (no attempt made)
    /// - `Error::PermanentFailure` on the first permanent failure (no backoff)
    /// - `Error::Degraded` on a failure outside the taxonomy (no retry)
    /// - `Error::TransientFailure` once every attempt failed transiently
    pub async fn execute_with_retry<T, F, Fut>(&self, cancel: &CancelToken, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, WorkerError>>,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("{}: cancelled before dispatch", self.name)));
        }

        let admission = match self.breaker().try_acquire() {
            Ok(admission) => admission,
            Err(retry_in) => {
                warn!(executor = %self.name, ?retry_in, "circuit open, rejecting call");
                return Err(Error::CircuitOpen {
                    name: self.name.clone(),
                    retry_in,
                });
            }
        };

        let max_attempts = self.policy.attempts();
        let mut attempt = 1;
        loop {
            trace!(executor = %self.name, attempt, "attempt starting");
            let failure =
                match tokio::time::timeout(self.policy.attempt_timeout, operation(attempt)).await {
                    Ok(Ok(value)) => {
                        self.breaker().record_success(admission);
                        debug!(executor = %self.name, attempt, "call succeeded");
                        return Ok(value);
                    }
                    Ok(Err(err)) => err,
                    Err(_) => WorkerError::classified(
                        ErrorType::Timeout,
                        format!(
                            "attempt {} timed out after {:?}",
                            attempt, self.policy.attempt_timeout
                        ),
                    ),
                };

            let classified = classify(&failure);
            let message = failure.message().to_string();
            match classified.status {
                ErrorStatus::Permanent => {
                    self.breaker().record_failure(admission);
                    warn!(executor = %self.name, attempt, kind = %classified.kind, "permanent failure: {}", message);
                    return Err(Error::PermanentFailure {
                        kind: classified.kind,
                        message,
                    });
                }
                ErrorStatus::Degraded => {
                    self.breaker().record_failure(admission);
                    warn!(executor = %self.name, attempt, "degraded failure: {}", message);
                    return Err(Error::Degraded(message));
                }
                ErrorStatus::Transient => {}
            }

            if attempt >= max_attempts {
                self.breaker().record_failure(admission);
                warn!(
                    executor = %self.name,
                    attempts = attempt,
                    kind = %classified.kind,
                    "retries exhausted: {}",
                    message
                );
                return Err(Error::TransientFailure {
                    attempts: attempt,
                    kind: classified.kind,
                    message,
                });
            }

            let delay = self.policy.backoff_for(attempt);
            debug!(
                executor = %self.name,
                attempt,
                kind = %classified.kind,
                ?delay,
                "transient failure, backing off: {}",
                message
            );
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            if cancel.is_cancelled() {
                self.breaker().release_trial(admission);
                return Err(Error::Cancelled(format!(
                    "{}: cancelled after attempt {}",
                    self.name, attempt
                )));
            }
            attempt += 1;
        }
    }

    /// Synchronous call sites: every attempt runs on the blocking pool with
    /// the same timeout, classification and breaker bookkeeping as
    /// [`execute_with_retry`](Self::execute_with_retry). A panic inside
    /// `operation` is a degraded failure.
    pub async fn execute_blocking_with_retry<T, F>(&self, cancel: &CancelToken, operation: F) -> Result<T>
    where
        F: Fn(u32) -> std::result::Result<T, WorkerError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let operation = Arc::new(operation);
        self.execute_with_retry(cancel, |attempt| {
            let op = Arc::clone(&operation);
            async move {
                crate::util::blocking(move || op(attempt))
                    .await
                    .unwrap_or_else(|e| Err(WorkerError::Unexpected(e.to_string())))
            }
        })
        .await
    }
}
