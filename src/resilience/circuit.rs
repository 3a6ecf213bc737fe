//! Failure-rate circuit breaker.
//!
//! CLOSED → OPEN once `failure_count >= threshold`. OPEN → HALF_OPEN once
//! `open_timeout` has elapsed since the last failure, admitting exactly one
//! trial call. HALF_OPEN → CLOSED on success, → OPEN on failure.
//!
//! Time comes from `tokio::time::Instant`, so a paused tokio clock drives
//! the breaker deterministically in tests.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Default consecutive failures before the breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default cool-down before a trial call is admitted.
pub const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 60;

/// Breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FAILURE_THRESHOLD,
            open_timeout: Duration::from_secs(DEFAULT_OPEN_TIMEOUT_SECS),
        }
    }
}

/// Observable phase of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Raw breaker bookkeeping.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub failure_count: u32,
    pub is_open: bool,
    pub last_failure: Option<Instant>,
    pub threshold: u32,
    pub open_timeout: Duration,
}

/// How a call got past the breaker.
///
/// Outcomes are reported back with the admission so that a call admitted
/// before the breaker opened cannot close it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted while closed.
    Closed,
    /// The single half-open trial call.
    Trial,
}

/// A point-in-time view of a breaker, safe to serialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub threshold: u32,
    pub open_timeout_ms: u64,
    /// Milliseconds since the last recorded failure, if any.
    pub since_last_failure_ms: Option<u64>,
}

/// Circuit breaker guarding one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitBreakerState,
    /// Set while the single half-open trial call is in flight.
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitBreakerState {
                failure_count: 0,
                is_open: false,
                last_failure: None,
                threshold: config.threshold.max(1),
                open_timeout: config.open_timeout,
            },
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        if !self.state.is_open {
            return CircuitState::Closed;
        }
        if self.cooldown_elapsed() {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    pub fn raw(&self) -> &CircuitBreakerState {
        &self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.state.failure_count
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open
    }

    /// Whether a call would currently be admitted.
    pub fn is_available(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !self.trial_in_flight,
            CircuitState::Open => false,
        }
    }

    /// Time left until the breaker admits a trial call.
    pub fn retry_in(&self) -> Duration {
        match self.state.last_failure {
            Some(at) if self.state.is_open => self.state.open_timeout.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    /// Admit a call, claiming the trial slot when half-open.
    ///
    /// Returns the remaining cool-down when the call is rejected.
    pub fn try_acquire(&mut self) -> std::result::Result<Admission, Duration> {
        match self.state() {
            CircuitState::Closed => Ok(Admission::Closed),
            CircuitState::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                Ok(Admission::Trial)
            }
            CircuitState::HalfOpen => Err(Duration::ZERO),
            CircuitState::Open => Err(self.retry_in()),
        }
    }

    /// Only the trial call closes an open breaker. Other outcomes that land
    /// while open were admitted before it opened and are ignored.
    pub fn record_success(&mut self, admission: Admission) {
        match admission {
            Admission::Trial => {
                self.state.failure_count = 0;
                self.state.is_open = false;
                self.trial_in_flight = false;
            }
            Admission::Closed if !self.state.is_open => self.state.failure_count = 0,
            Admission::Closed => {}
        }
    }

    pub fn record_failure(&mut self, admission: Admission) {
        if admission == Admission::Closed && self.state.is_open {
            return;
        }
        self.state.failure_count = self.state.failure_count.saturating_add(1);
        self.state.last_failure = Some(Instant::now());
        if admission == Admission::Trial || self.state.failure_count >= self.state.threshold {
            self.state.is_open = true;
        }
        if admission == Admission::Trial {
            self.trial_in_flight = false;
        }
    }

    /// Give back a claimed trial slot without judging the dependency.
    pub fn release_trial(&mut self, admission: Admission) {
        if admission == Admission::Trial {
            self.trial_in_flight = false;
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state(),
            failure_count: self.state.failure_count,
            threshold: self.state.threshold,
            open_timeout_ms: self.state.open_timeout.as_millis() as u64,
            since_last_failure_ms: self
                .state
                .last_failure
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }

    fn cooldown_elapsed(&self) -> bool {
        self.state
            .last_failure
            .map(|at| at.elapsed() >= self.state.open_timeout)
            .unwrap_or(true)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
