//! End-to-end graph tests.
//!
//! These tests verify that goals become valid graphs, that the scheduler's
//! analysis holds for the canonical shapes, and that execution honours
//! dependency order, failure isolation and fallback routing.

use std::time::Duration;

use conductor::config::PlanConfig;
use conductor::core::dag::{Complexity, ExecutionMode};
use conductor::core::task::{SubtaskId, SubtaskSpec, SubtaskStatus};
use conductor::orchestration::{
    plan_goal, run_specs, ExecutionOutcome, OrchestratorEvent, RegistryEvent, TaskGraphScheduler,
    TemplateDecomposer,
};
use conductor::resilience::ErrorType;
use conductor::session::CancelToken;
use conductor::worker::{ResponseStatus, WorkerId, WorkerRequest};
use conductor::Error;

use crate::fixtures::{
    chain_specs, diamond_specs, independent_specs, join_specs, OrchestratorHarness,
    RegistryHarness, ScriptedWorker,
};

fn ids(level: &std::collections::BTreeSet<SubtaskId>) -> Vec<&str> {
    level.iter().map(|id| id.as_str()).collect()
}

// Graph validation

/// Test: Cycles are rejected before anything is dispatched
#[tokio::test]
async fn test_cyclic_graph_is_rejected_without_dispatch() {
    let worker = ScriptedWorker::new("w").into_arc();
    let harness = OrchestratorHarness::new(vec![worker.clone()]);

    let specs = vec![
        SubtaskSpec::new("a", "a", "w").depends_on("c"),
        SubtaskSpec::new("b", "b", "w").depends_on("a"),
        SubtaskSpec::new("c", "c", "w").depends_on("b"),
    ];
    let err = run_specs(
        &harness.orchestrator,
        "loop",
        Complexity::Medium,
        specs,
        &CancelToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Decomposition(_)));
    assert_eq!(worker.calls(), 0, "nothing may run from a cyclic graph");
}

/// Test: Every dependency must name a subtask in the same graph
#[test]
fn test_dangling_dependency_is_rejected() {
    let specs = vec![
        SubtaskSpec::new("a", "a", "w"),
        SubtaskSpec::new("b", "b", "w").depends_on("ghost"),
    ];
    let err = TaskGraphScheduler::build("g", Complexity::Medium, specs).unwrap_err();
    assert!(matches!(err, Error::Decomposition(_)));
    assert!(err.to_string().contains("ghost"));
}

// Scheduling analysis

/// Test: Levels are minimal
/// Given a graph with a long and a short branch into one sink
/// Then each subtask sits one level above its deepest dependency
#[test]
fn test_levels_are_minimal() {
    let specs = vec![
        SubtaskSpec::new("a", "a", "w"),
        SubtaskSpec::new("b", "b", "w").depends_on("a"),
        SubtaskSpec::new("c", "c", "w").depends_on("b"),
        SubtaskSpec::new("d", "d", "w"),
        SubtaskSpec::new("e", "e", "w").depends_on("c").depends_on("d"),
        SubtaskSpec::new("f", "f", "w").depends_on("d"),
    ];
    let graph = TaskGraphScheduler::build("g", Complexity::Complex, specs).unwrap();
    let levels = TaskGraphScheduler::levels(&graph);

    assert_eq!(levels.len(), 4);
    assert_eq!(ids(&levels[0]), vec!["a", "d"]);
    assert_eq!(ids(&levels[1]), vec!["b", "f"]);
    assert_eq!(ids(&levels[2]), vec!["c"]);
    assert_eq!(ids(&levels[3]), vec!["e"]);
}

/// Test: Chain of N subtasks of duration d has critical path N·d
#[test]
fn test_chain_critical_path() {
    let graph = TaskGraphScheduler::build("g", Complexity::Complex, chain_specs(4, "w", 3)).unwrap();
    assert_eq!(graph.mode(), ExecutionMode::Parallel);
    assert_eq!(graph.total_duration(), Duration::from_secs(12));
    assert_eq!(TaskGraphScheduler::levels(&graph).len(), 4);
}

/// Test: Independent subtasks of 2, 5 and 3 seconds take 5 in parallel
#[test]
fn test_independent_critical_path_is_longest() {
    let graph =
        TaskGraphScheduler::build("g", Complexity::Medium, independent_specs("w", &[2, 5, 3]))
            .unwrap();
    assert_eq!(graph.mode(), ExecutionMode::Parallel);
    assert_eq!(graph.total_duration(), Duration::from_secs(5));
    assert_eq!(TaskGraphScheduler::levels(&graph).len(), 1);
}

/// Test: C after independent A and B
/// Then level 0 = {A, B}, level 1 = {C}, critical path = max(A, B) + C
#[test]
fn test_join_levels_and_critical_path() {
    let graph = TaskGraphScheduler::build("g", Complexity::Medium, join_specs("w", 4, 7, 2)).unwrap();
    let levels = TaskGraphScheduler::levels(&graph);
    assert_eq!(ids(&levels[0]), vec!["a", "b"]);
    assert_eq!(ids(&levels[1]), vec!["c"]);
    assert_eq!(graph.total_duration(), Duration::from_secs(9));
}

/// Test: A simple goal is one sequential subtask
#[tokio::test]
async fn test_simple_goal_plans_single_sequential_subtask() {
    let harness = RegistryHarness::new(Some("w"), vec![ScriptedWorker::new("w").into_arc()]);
    let decomposer = TemplateDecomposer::new(harness.registry.clone(), PlanConfig::default());

    let graph = plan_goal(&decomposer, "simple task", Some(Complexity::Simple))
        .await
        .unwrap();

    assert_eq!(graph.len(), 1);
    assert_eq!(graph.mode(), ExecutionMode::Sequential);
    let only = graph.subtasks().next().unwrap();
    assert_eq!(graph.total_duration(), only.estimated_duration);
}

// Execution

/// Test: Diamond runs in dependency order, one level at a time
#[tokio::test]
async fn test_diamond_runs_level_by_level() {
    let worker = ScriptedWorker::new("w").into_arc();
    let mut harness = OrchestratorHarness::new(vec![worker.clone()]);

    let (graph, report) = run_specs(
        &harness.orchestrator,
        "diamond",
        Complexity::Medium,
        diamond_specs("w"),
        &CancelToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert!(report.skipped.is_empty());
    assert_eq!(report.results.len(), 4);

    let seen = worker.instructions();
    assert_eq!(seen.first().map(String::as_str), Some("start"));
    assert_eq!(seen.last().map(String::as_str), Some("finish"));

    let sink = graph.get(&SubtaskId::from("sink")).unwrap();
    assert!(sink.is_completed());

    let levels_started = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, OrchestratorEvent::LevelStarted { .. }))
        .count();
    assert_eq!(levels_started, 3);
}

/// Test: Subtasks of one level run concurrently
/// Given three independent subtasks on three workers that each take 1s
/// Then the run takes about 1s, not 3s
#[tokio::test(start_paused = true)]
async fn test_level_dispatches_concurrently() {
    let workers: Vec<_> = ["x", "y", "z"]
        .iter()
        .map(|id| {
            ScriptedWorker::new(id)
                .with_delay(Duration::from_secs(1))
                .into_arc()
        })
        .collect();
    let harness = OrchestratorHarness::new(workers);
    let specs = vec![
        SubtaskSpec::new("a", "a", "x"),
        SubtaskSpec::new("b", "b", "y"),
        SubtaskSpec::new("c", "c", "z"),
    ];

    let (_, report) = run_specs(
        &harness.orchestrator,
        "fan out",
        Complexity::Medium,
        specs,
        &CancelToken::new(),
    )
    .await
    .unwrap();

    assert!(report.is_success());
    assert!(report.elapsed < Duration::from_secs(2), "took {:?}", report.elapsed);
}

/// Test: A failure is isolated to its own branch
/// Given `bad` fails permanently and `good` succeeds in the same level
/// Then `good` and its dependent complete, `bad`'s dependent is skipped
#[tokio::test]
async fn test_failure_isolated_within_level() {
    let good = ScriptedWorker::new("good").into_arc();
    let bad = ScriptedWorker::new("bad")
        .failing(1, ErrorType::InvalidRequest)
        .into_arc();
    let harness = OrchestratorHarness::new(vec![good.clone(), bad.clone()]);
    let specs = vec![
        SubtaskSpec::new("g1", "good one", "good"),
        SubtaskSpec::new("b1", "bad one", "bad"),
        SubtaskSpec::new("g2", "after good", "good").depends_on("g1"),
        SubtaskSpec::new("b2", "after bad", "good").depends_on("b1"),
    ];

    let (graph, report) = run_specs(
        &harness.orchestrator,
        "mixed",
        Complexity::Medium,
        specs,
        &CancelToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.outcome, ExecutionOutcome::PartiallyFailed);
    assert_eq!(report.skipped, vec![SubtaskId::from("b2")]);
    assert!(graph.get(&SubtaskId::from("g2")).unwrap().is_completed());
    assert!(matches!(
        graph.get(&SubtaskId::from("b1")).unwrap().status,
        SubtaskStatus::Failed { .. }
    ));
    assert_eq!(bad.calls(), 1, "permanent failures are not retried");
    assert!(report.error.unwrap().contains("b1"));
}

/// Test: A sequential run reports an explicit failure marker
#[tokio::test]
async fn test_sequential_failure_is_partially_failed() {
    let worker = ScriptedWorker::new("w")
        .failing(1, ErrorType::NotFound)
        .into_arc();
    let harness = OrchestratorHarness::new(vec![worker]);

    let (_, report) = run_specs(
        &harness.orchestrator,
        "one thing",
        Complexity::Simple,
        vec![SubtaskSpec::new("only", "do it", "w")],
        &CancelToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(report.mode, ExecutionMode::Sequential);
    assert_eq!(report.outcome, ExecutionOutcome::PartiallyFailed);
    assert!(report.error.unwrap().starts_with("subtask only failed"));
}

/// Test: Cancelling mid-run stops later levels
#[tokio::test(start_paused = true)]
async fn test_cancel_between_levels_skips_rest() {
    let worker = ScriptedWorker::new("w")
        .with_delay(Duration::from_secs(1))
        .into_arc();
    let harness = OrchestratorHarness::new(vec![worker.clone()]);
    let cancel = CancelToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        })
    };

    let (_, report) = run_specs(
        &harness.orchestrator,
        "chain",
        Complexity::Medium,
        chain_specs(3, "w", 1),
        &cancel,
    )
    .await
    .unwrap();
    canceller.await.unwrap();

    assert_eq!(report.outcome, ExecutionOutcome::Cancelled);
    // The first subtask was already at the worker and ran to completion.
    assert_eq!(worker.calls(), 1);
    assert_eq!(report.skipped.len(), 2);
}

// Routing

/// Test: Unknown worker falls back to the default
#[tokio::test]
async fn test_ghost_worker_falls_back_to_default() {
    let main = ScriptedWorker::new("main").into_arc();
    let mut harness = RegistryHarness::new(Some("main"), vec![main.clone()]);

    let response = harness
        .registry
        .dispatch(
            &WorkerId::from("ghost"),
            WorkerRequest::new("hello"),
            &CancelToken::new(),
        )
        .await;

    assert!(response.is_success());
    assert_eq!(response.metadata["worker_id"], "main");
    assert_eq!(main.calls(), 1);
    assert!(harness.drain_events().iter().any(|e| matches!(
        e,
        RegistryEvent::Fallback { requested, used }
            if requested.as_str() == "ghost" && used.as_str() == "main"
    )));
}

/// Test: Missing default yields a structured error, not a panic
#[tokio::test]
async fn test_ghost_worker_without_default_is_structured_error() {
    let harness = RegistryHarness::new(Some("absent"), vec![ScriptedWorker::new("w").into_arc()]);

    let response = harness
        .registry
        .dispatch(
            &WorkerId::from("ghost"),
            WorkerRequest::new("hello"),
            &CancelToken::new(),
        )
        .await;

    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.metadata["error"], "worker_not_found");
}

/// Test: Shutdown drains workers and closes the registry
#[tokio::test]
async fn test_shutdown_reaches_every_worker() {
    let a = ScriptedWorker::new("a").into_arc();
    let b = ScriptedWorker::new("b").into_arc();
    let harness = RegistryHarness::new(None, vec![a.clone(), b.clone()]);

    harness.registry.shutdown().await;

    assert!(a.was_shut_down() && b.was_shut_down());
    assert!(harness.registry.is_closed());
    let err = harness
        .registry
        .try_dispatch(&WorkerId::from("a"), WorkerRequest::new("late"), &CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RegistryClosed));
}
