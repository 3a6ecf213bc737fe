//! Conductor: goal orchestration over a pool of pluggable workers.
//!
//! A goal is decomposed into a dependency graph of subtasks, each routed to
//! a worker by id or capability. Every dispatch goes through a
//! per-worker [`resilience::ResilientExecutor`] (retry with backoff, attempt
//! timeout, circuit breaker). Clients drive runs over the
//! [`control`] channel and can stop them or reconnect to them through the
//! [`session::SessionController`].

pub mod config;
pub mod control;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod resilience;
pub mod session;
pub mod util;
pub mod worker;

pub use error::{Error, Result};
