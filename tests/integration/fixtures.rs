//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted in-process workers
//! - Registries and orchestrators wired with event channels
//! - Predefined subtask sets (chain, diamond, independent)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use conductor::core::task::SubtaskSpec;
use conductor::orchestration::{
    Orchestrator, OrchestratorEvent, RegistryConfig, RegistryEvent, WorkerRegistry,
};
use conductor::resilience::{CircuitBreakerConfig, ErrorType, RetryPolicy};
use conductor::worker::{CapabilityShape, Worker, WorkerError, WorkerId, WorkerRequest, WorkerResponse};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(String),
    Fail(WorkerError),
    Respond(WorkerResponse),
}

/// A worker that replays a script, then echoes (or keeps failing).
pub struct ScriptedWorker {
    id: WorkerId,
    capabilities: Vec<String>,
    script: Mutex<VecDeque<Step>>,
    after_script: Option<WorkerError>,
    delay: Duration,
    calls: AtomicUsize,
    instructions: Mutex<Vec<String>>,
    shut_down: AtomicBool,
}

impl ScriptedWorker {
    pub fn new(id: &str) -> Self {
        Self {
            id: WorkerId::from(id),
            capabilities: Vec::new(),
            script: Mutex::new(VecDeque::new()),
            after_script: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            instructions: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_capabilities(mut self, tags: &[&str]) -> Self {
        self.capabilities = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Sleep this long (on the tokio clock) before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then(self, step: Step) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    /// Fail `times` times with `kind`, then fall through to echoing.
    pub fn failing(mut self, times: usize, kind: ErrorType) -> Self {
        for i in 0..times {
            self = self.then(Step::Fail(WorkerError::classified(
                kind,
                format!("scripted failure {}", i + 1),
            )));
        }
        self
    }

    /// Fail with `err` on every call once the script is exhausted.
    pub fn always_failing(mut self, err: WorkerError) -> Self {
        self.after_script = Some(err);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn instructions(&self) -> Vec<String> {
        self.instructions.lock().unwrap().clone()
    }

    pub fn was_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn id(&self) -> WorkerId {
        self.id.clone()
    }

    fn capabilities(&self) -> CapabilityShape {
        CapabilityShape::Tags(self.capabilities.clone())
    }

    async fn execute(&self, request: WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.instructions
            .lock()
            .unwrap()
            .push(request.instruction.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Succeed(content)) => Ok(WorkerResponse::success(content)),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Respond(response)) => Ok(response),
            None => match &self.after_script {
                Some(err) => Err(err.clone()),
                None => Ok(WorkerResponse::success(format!(
                    "{}: {}",
                    self.id, request.instruction
                ))),
            },
        }
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Retry policy with short, predictable delays.
pub fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff: Duration::from_millis(100),
        backoff_multiplier: 2.0,
        max_backoff: Duration::from_secs(1),
        attempt_timeout: Duration::from_secs(5),
    }
}

pub fn breaker(threshold: u32, open_secs: u64) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        threshold,
        open_timeout: Duration::from_secs(open_secs),
    }
}

/// A registry with its event stream.
pub struct RegistryHarness {
    pub registry: Arc<WorkerRegistry>,
    pub event_rx: mpsc::UnboundedReceiver<RegistryEvent>,
}

impl RegistryHarness {
    pub fn new(default_worker: Option<&str>, workers: Vec<Arc<ScriptedWorker>>) -> Self {
        Self::with_config(
            RegistryConfig {
                default_worker: default_worker.map(WorkerId::from),
                retry: fast_policy(3),
                breaker: breaker(5, 60),
                ..RegistryConfig::default()
            },
            workers,
        )
    }

    pub fn with_config(config: RegistryConfig, workers: Vec<Arc<ScriptedWorker>>) -> Self {
        let (tx, event_rx) = mpsc::unbounded_channel();
        let registry = WorkerRegistry::new(config).with_events(tx);
        for worker in workers {
            registry.register(worker);
        }
        Self {
            registry: Arc::new(registry),
            event_rx,
        }
    }

    pub fn drain_events(&mut self) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// An orchestrator over a registry, with its event stream.
pub struct OrchestratorHarness {
    pub registry: Arc<WorkerRegistry>,
    pub orchestrator: Orchestrator,
    pub event_rx: mpsc::UnboundedReceiver<OrchestratorEvent>,
}

impl OrchestratorHarness {
    pub fn new(workers: Vec<Arc<ScriptedWorker>>) -> Self {
        let registry = RegistryHarness::new(None, workers).registry;
        let (tx, event_rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(Arc::clone(&registry)).with_events(tx);
        Self {
            registry,
            orchestrator,
            event_rx,
        }
    }

    pub fn drain_events(&mut self) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// A linear chain `t0 <- t1 <- ... <- t(n-1)`, each `secs` long.
pub fn chain_specs(n: usize, worker: &str, secs: u64) -> Vec<SubtaskSpec> {
    (0..n)
        .map(|i| {
            let spec = SubtaskSpec::new(format!("t{}", i), format!("step {}", i), worker)
                .with_duration(Duration::from_secs(secs));
            if i == 0 {
                spec
            } else {
                spec.depends_on(format!("t{}", i - 1))
            }
        })
        .collect()
}

/// Independent subtasks `i0..` with the given durations.
pub fn independent_specs(worker: &str, durations: &[u64]) -> Vec<SubtaskSpec> {
    durations
        .iter()
        .enumerate()
        .map(|(i, secs)| {
            SubtaskSpec::new(format!("i{}", i), format!("independent {}", i), worker)
                .with_duration(Duration::from_secs(*secs))
        })
        .collect()
}

/// `c` depends on independent `a` and `b`.
pub fn join_specs(worker: &str, a: u64, b: u64, c: u64) -> Vec<SubtaskSpec> {
    vec![
        SubtaskSpec::new("a", "left", worker).with_duration(Duration::from_secs(a)),
        SubtaskSpec::new("b", "right", worker).with_duration(Duration::from_secs(b)),
        SubtaskSpec::new("c", "merge", worker)
            .depends_on("a")
            .depends_on("b")
            .with_duration(Duration::from_secs(c)),
    ]
}

/// `root -> {left, right} -> sink`.
pub fn diamond_specs(worker: &str) -> Vec<SubtaskSpec> {
    vec![
        SubtaskSpec::new("root", "start", worker),
        SubtaskSpec::new("left", "left branch", worker).depends_on("root"),
        SubtaskSpec::new("right", "right branch", worker).depends_on("root"),
        SubtaskSpec::new("sink", "finish", worker)
            .depends_on("left")
            .depends_on("right"),
    ]
}
