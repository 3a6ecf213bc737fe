//! Resilience layer: failure classification, circuit breaking and retries.

pub mod circuit;
pub mod classify;
pub mod executor;

pub use circuit::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitSnapshot, CircuitState};
pub use classify::{classify, classify_message, ClassifiedError, ErrorStatus, ErrorType};
pub use executor::{ResilientExecutor, RetryPolicy};
