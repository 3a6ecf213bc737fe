//! Resilience tests.
//!
//! These tests verify retry budgets, error classification and the circuit
//! breaker, both on a bare `ResilientExecutor` and through the registry.
//! Timing runs on a paused tokio clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

use conductor::orchestration::{RegistryConfig, WorkerStatus};
use conductor::resilience::{CircuitState, ErrorType, ResilientExecutor};
use conductor::session::CancelToken;
use conductor::worker::{ResponseStatus, WorkerError, WorkerId, WorkerRequest, WorkerResponse};
use conductor::Error;

use crate::fixtures::{breaker, fast_policy, RegistryHarness, ScriptedWorker, Step};

fn executor(max_retries: u32, threshold: u32) -> ResilientExecutor {
    ResilientExecutor::new("test", fast_policy(max_retries), breaker(threshold, 30))
}

// Retry budget

/// Test: Transient failures within budget
/// Given an operation that fails transiently max_retries - 1 times
/// Then the call succeeds and the breaker holds no failures
#[tokio::test(start_paused = true)]
async fn test_transient_failures_then_success() {
    let executor = executor(3, 5);
    let calls = AtomicUsize::new(0);
    let started = Instant::now();

    let result = executor
        .execute_with_retry(&CancelToken::new(), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(WorkerError::classified(ErrorType::ConnectionError, "flaky link"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

    assert_eq!(assert_ok!(result), "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(executor.failure_count(), 0);
    // 100ms then 200ms of backoff.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(400));
}

/// Test: Permanent failures are never retried
/// Then exactly one attempt, no backoff, and one breaker failure
#[tokio::test(start_paused = true)]
async fn test_permanent_failure_single_attempt() {
    let executor = executor(5, 10);
    let calls = AtomicUsize::new(0);
    let before = executor.failure_count();
    let started = Instant::now();

    let result: conductor::Result<()> = executor
        .execute_with_retry(&CancelToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(WorkerError::classified(ErrorType::AuthError, "bad key")) }
        })
        .await;

    let err = assert_err!(result);
    assert!(matches!(
        err,
        Error::PermanentFailure {
            kind: ErrorType::AuthError,
            ..
        }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(executor.failure_count(), before + 1);
}

/// Test: Exhausted retries report the attempt count and last error
#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_are_annotated() {
    let executor = executor(4, 10);

    let result: conductor::Result<()> = executor
        .execute_with_retry(&CancelToken::new(), |attempt| async move {
            Err(WorkerError::opaque(format!("503 service unavailable ({})", attempt)))
        })
        .await;

    match assert_err!(result) {
        Error::TransientFailure {
            attempts,
            kind,
            message,
        } => {
            assert_eq!(attempts, 4);
            assert_eq!(kind, ErrorType::ServerError);
            assert!(message.ends_with("(4)"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(executor.failure_count(), 1, "one failed call, one failure");
}

/// Test: An attempt that outlives its timeout is a transient timeout
#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_is_transient() {
    let executor = executor(2, 10);
    let calls = AtomicUsize::new(0);

    let result: conductor::Result<()> = executor
        .execute_with_retry(&CancelToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        })
        .await;

    assert!(matches!(
        result,
        Err(Error::TransientFailure {
            attempts: 2,
            kind: ErrorType::Timeout,
            ..
        })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Test: Cancelling during backoff stops the retry loop
/// Then the call is cancelled, not failed, and the breaker is untouched
#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let executor = executor(5, 10);
    let cancel = CancelToken::new();
    let calls = AtomicUsize::new(0);

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let result: conductor::Result<()> = executor
        .execute_with_retry(&cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(WorkerError::classified(ErrorType::RateLimit, "slow down")) }
        })
        .await;
    canceller.await.unwrap();

    assert!(assert_err!(result).is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.failure_count(), 0);
}

// Circuit breaker

/// Test: Breaker opens at threshold and recovers after the cool-down
#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_recovers() {
    let executor = executor(1, 3);
    let calls = AtomicUsize::new(0);
    let fail = || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>(WorkerError::classified(ErrorType::NotFound, "gone")) }
    };

    for _ in 0..3 {
        assert_err!(executor.execute_with_retry(&CancelToken::new(), |_| fail()).await);
    }
    assert!(!executor.is_available());
    assert_eq!(executor.breaker_snapshot().state, CircuitState::Open);

    // Rejected without touching the operation.
    let rejected = executor
        .execute_with_retry(&CancelToken::new(), |_| fail())
        .await;
    assert!(matches!(rejected, Err(Error::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(executor.is_available());
    assert_eq!(executor.breaker_snapshot().state, CircuitState::HalfOpen);

    let recovered = executor
        .execute_with_retry(&CancelToken::new(), |_| async { Ok::<_, WorkerError>(7) })
        .await;
    assert_eq!(assert_ok!(recovered), 7);
    assert_eq!(executor.breaker_snapshot().state, CircuitState::Closed);
    assert_eq!(executor.failure_count(), 0);
}

// Through the registry

/// Test: Opaque error text is classified heuristically
#[tokio::test(start_paused = true)]
async fn test_opaque_auth_error_is_permanent() {
    let worker = ScriptedWorker::new("w")
        .then(Step::Respond(WorkerResponse::error("HTTP 401 Unauthorized", None)))
        .into_arc();
    let harness = RegistryHarness::new(None, vec![worker.clone()]);

    let response = harness
        .registry
        .dispatch(&WorkerId::from("w"), WorkerRequest::new("x"), &CancelToken::new())
        .await;

    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.error_type, Some(ErrorType::AuthError));
    assert_eq!(response.metadata["error"], "permanent_failure");
    assert_eq!(worker.calls(), 1);
}

/// Test: An explicit error type wins over the message text
#[tokio::test(start_paused = true)]
async fn test_explicit_error_type_beats_keywords() {
    let worker = ScriptedWorker::new("w")
        .then(Step::Respond(WorkerResponse::error(
            "request timed out",
            Some(ErrorType::InvalidRequest),
        )))
        .into_arc();
    let harness = RegistryHarness::new(None, vec![worker.clone()]);

    let response = harness
        .registry
        .dispatch(&WorkerId::from("w"), WorkerRequest::new("x"), &CancelToken::new())
        .await;

    assert_eq!(response.error_type, Some(ErrorType::InvalidRequest));
    assert_eq!(worker.calls(), 1, "a timeout keyword must not trigger a retry");
}

/// Test: A failing worker trips its own breaker only
#[tokio::test(start_paused = true)]
async fn test_registry_breaker_is_per_worker() {
    let broken = ScriptedWorker::new("broken")
        .always_failing(WorkerError::classified(ErrorType::NotFound, "missing"))
        .into_arc();
    let healthy = ScriptedWorker::new("healthy").into_arc();
    let harness = RegistryHarness::with_config(
        RegistryConfig {
            retry: fast_policy(1),
            breaker: breaker(2, 60),
            ..RegistryConfig::default()
        },
        vec![broken.clone(), healthy.clone()],
    );
    let cancel = CancelToken::new();

    for _ in 0..2 {
        harness
            .registry
            .dispatch(&WorkerId::from("broken"), WorkerRequest::new("x"), &cancel)
            .await;
    }
    let rejected = harness
        .registry
        .dispatch(&WorkerId::from("broken"), WorkerRequest::new("x"), &cancel)
        .await;
    assert_eq!(rejected.metadata["error"], "circuit_open");
    assert_eq!(broken.calls(), 2);

    let ok = harness
        .registry
        .dispatch(&WorkerId::from("healthy"), WorkerRequest::new("x"), &cancel)
        .await;
    assert!(ok.is_success());

    let snapshot = harness.registry.snapshot();
    let state_of = |id: &str| {
        snapshot
            .iter()
            .find(|w| w.id.as_str() == id)
            .map(|w| w.circuit.state)
    };
    assert_eq!(state_of("broken"), Some(CircuitState::Open));
    assert_eq!(state_of("healthy"), Some(CircuitState::Closed));
}

/// Test: A cancelled dispatch leaves the worker ready
/// Given a worker that keeps failing transiently
/// When the caller cancels during backoff
/// Then the dispatch reports cancelled and the worker is ready again
#[tokio::test(start_paused = true)]
async fn test_cancelled_dispatch_restores_ready() {
    let worker = ScriptedWorker::new("w")
        .always_failing(WorkerError::classified(ErrorType::RateLimit, "slow down"))
        .into_arc();
    let harness = RegistryHarness::new(None, vec![worker.clone()]);
    let cancel = CancelToken::new();

    let dispatch = {
        let registry = harness.registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            registry
                .dispatch(&WorkerId::from("w"), WorkerRequest::new("x"), &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        harness.registry.status(&WorkerId::from("w")),
        Some(WorkerStatus::Busy)
    );
    cancel.cancel();

    let response = dispatch.await.unwrap();
    assert_eq!(response.status, ResponseStatus::Cancelled);
    assert_eq!(
        harness.registry.status(&WorkerId::from("w")),
        Some(WorkerStatus::Ready)
    );
    assert_eq!(worker.calls(), 1);
}
