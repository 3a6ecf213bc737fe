//! Worker registry and dispatch.
//!
//! The `WorkerRegistry` maps worker ids to live workers, normalizes their
//! capabilities at registration, and routes every dispatch through the
//! worker's own [`ResilientExecutor`]. Each worker has a request queue (a
//! semaphore) bounding how many calls reach it at once. Status changes and
//! fallbacks are emitted as [`RegistryEvent`]s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::resilience::{CircuitBreakerConfig, CircuitSnapshot, ResilientExecutor, RetryPolicy};
use crate::session::CancelToken;
use crate::worker::{
    CapabilitySet, ResponseStatus, Worker, WorkerError, WorkerId, WorkerRequest, WorkerResponse,
};

/// Default number of concurrent calls a single worker accepts.
pub const DEFAULT_MAX_CONCURRENT_PER_WORKER: usize = 1;

/// Events emitted by the registry.
///
/// These let observers (the control channel, tests) follow worker state
/// without polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A worker was registered under a new id.
    Registered { worker_id: WorkerId },
    /// A registration overwrote an existing worker with the same id.
    Replaced { worker_id: WorkerId },
    /// Dispatch targeted an unknown worker and went to the default.
    Fallback { requested: WorkerId, used: WorkerId },
    /// A dispatch arrived; `in_flight` counts it and any already queued.
    Busy { worker_id: WorkerId, in_flight: usize },
    /// The last in-flight dispatch for the worker finished.
    Ready { worker_id: WorkerId },
    Unregistered { worker_id: WorkerId },
    /// Every worker was drained and shut down.
    ShutDown,
}

/// Advisory availability of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Ready,
    Busy,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Ready => write!(f, "ready"),
            WorkerStatus::Busy => write!(f, "busy"),
        }
    }
}

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Worker used when a dispatch names an unknown id.
    pub default_worker: Option<WorkerId>,
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    pub max_concurrent_per_worker: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_worker: None,
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            max_concurrent_per_worker: DEFAULT_MAX_CONCURRENT_PER_WORKER,
        }
    }
}

/// Serializable view of one registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub capabilities: CapabilitySet,
    pub status: WorkerStatus,
    pub in_flight: usize,
    pub circuit: CircuitSnapshot,
}

/// Outcome of a successful typed dispatch.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// The worker that actually handled the request.
    pub worker_id: WorkerId,
    /// Whether the request was rerouted to the default worker.
    pub fell_back: bool,
    pub response: WorkerResponse,
}

struct WorkerRecord {
    id: WorkerId,
    capabilities: CapabilitySet,
    status: WorkerStatus,
    in_flight: usize,
    /// Bumped on every registration so stale guards leave a replacement alone.
    generation: u64,
    worker: Arc<dyn Worker>,
    executor: Arc<ResilientExecutor>,
    queue: Arc<Semaphore>,
}

#[derive(Default)]
struct RegistryState {
    records: HashMap<WorkerId, WorkerRecord>,
    /// Registration order, used for capability lookups.
    order: Vec<WorkerId>,
    closed: bool,
    next_generation: u64,
}

/// Handles cloned out of a record for the duration of one dispatch.
struct Route {
    worker_id: WorkerId,
    fell_back: bool,
    generation: u64,
    worker: Arc<dyn Worker>,
    executor: Arc<ResilientExecutor>,
    queue: Arc<Semaphore>,
}

/// Registry of workers keyed by id.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use conductor::orchestration::{RegistryConfig, WorkerRegistry};
/// use conductor::session::CancelToken;
/// use conductor::worker::{CommandWorker, WorkerRequest};
///
/// let registry = WorkerRegistry::new(RegistryConfig::default());
/// registry.register(Arc::new(CommandWorker::new("echo", "echo")));
/// let response = registry
///     .dispatch(&"echo".into(), WorkerRequest::new("hi"), &CancelToken::new())
///     .await;
/// assert!(response.is_success());
/// ```
pub struct WorkerRegistry {
    state: Mutex<RegistryState>,
    config: RegistryConfig,
    event_tx: Option<mpsc::UnboundedSender<RegistryEvent>>,
}

impl WorkerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            config,
            event_tx: None,
        }
    }

    /// Emit registry events on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RegistryEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn default_worker(&self) -> Option<&WorkerId> {
        self.config.default_worker.as_ref()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: RegistryEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Register `worker`, normalizing its capabilities.
    ///
    /// A worker registered under an id that is already taken replaces the
    /// previous one. Returns true in that case.
    pub fn register(&self, worker: Arc<dyn Worker>) -> bool {
        let id = worker.id();
        let capabilities = worker.capabilities().normalize();
        let executor = Arc::new(ResilientExecutor::new(
            id.as_str(),
            self.config.retry.clone(),
            self.config.breaker,
        ));
        let queue = Arc::new(Semaphore::new(self.config.max_concurrent_per_worker.max(1)));

        let replaced = {
            let mut state = self.state();
            let generation = state.next_generation;
            state.next_generation += 1;
            let record = WorkerRecord {
                id: id.clone(),
                capabilities: capabilities.clone(),
                status: WorkerStatus::Ready,
                in_flight: 0,
                generation,
                worker,
                executor,
                queue,
            };
            let replaced = state.records.insert(id.clone(), record).is_some();
            if !replaced {
                state.order.push(id.clone());
            }
            replaced
        };

        if replaced {
            warn!(worker = %id, "worker id already registered, replacing previous worker");
            self.emit(RegistryEvent::Replaced { worker_id: id });
        } else {
            info!(worker = %id, capabilities = %capabilities, "worker registered");
            self.emit(RegistryEvent::Registered { worker_id: id });
        }
        replaced
    }

    /// Remove a worker. In-flight dispatches to it run to completion.
    pub fn unregister(&self, id: &WorkerId) -> bool {
        let removed = {
            let mut state = self.state();
            let removed = state.records.remove(id).is_some();
            state.order.retain(|w| w != id);
            removed
        };
        if removed {
            info!(worker = %id, "worker unregistered");
            self.emit(RegistryEvent::Unregistered {
                worker_id: id.clone(),
            });
        }
        removed
    }

    pub fn contains(&self, id: &WorkerId) -> bool {
        self.state().records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered ids in registration order.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.state().order.clone()
    }

    pub fn status(&self, id: &WorkerId) -> Option<WorkerStatus> {
        self.state().records.get(id).map(|r| r.status)
    }

    pub fn capabilities(&self, id: &WorkerId) -> Option<CapabilitySet> {
        self.state().records.get(id).map(|r| r.capabilities.clone())
    }

    /// First worker, in registration order, advertising `tag`.
    pub fn find_by_capability(&self, tag: &str) -> Option<WorkerId> {
        let state = self.state();
        state
            .order
            .iter()
            .find(|id| state.records.get(*id).is_some_and(|r| r.capabilities.contains(tag)))
            .cloned()
    }

    /// Every worker advertising `tag`, in registration order.
    pub fn find_all_by_capability(&self, tag: &str) -> Vec<WorkerId> {
        let state = self.state();
        state
            .order
            .iter()
            .filter(|id| state.records.get(*id).is_some_and(|r| r.capabilities.contains(tag)))
            .cloned()
            .collect()
    }

    /// Point-in-time view of every worker, in registration order.
    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.records.get(id))
            .map(|r| WorkerInfo {
                id: r.id.clone(),
                capabilities: r.capabilities.clone(),
                status: r.status,
                in_flight: r.in_flight,
                circuit: r.executor.breaker_snapshot(),
            })
            .collect()
    }

    /// Dispatch and fold every failure into a structured response.
    ///
    /// Never fails: a missing worker, an open circuit, exhausted retries
    /// and cancellation all come back as a `WorkerResponse` with status
    /// `error` or `cancelled` and the failure described in its metadata.
    pub async fn dispatch(
        &self,
        worker_id: &WorkerId,
        request: WorkerRequest,
        cancel: &CancelToken,
    ) -> WorkerResponse {
        match self.try_dispatch(worker_id, request, cancel).await {
            Ok(dispatched) => dispatched
                .response
                .with_metadata("worker_id", dispatched.worker_id.as_str().into()),
            Err(err) => WorkerResponse::from_error(&err)
                .with_metadata("worker_id", worker_id.as_str().into()),
        }
    }

    /// Dispatch `request` to `worker_id` (or the default worker).
    ///
    /// The call waits in the worker's queue, cancellably, then runs under
    /// the worker's executor. A response with status `error` is treated as
    /// a failed attempt.
    ///
    /// # Errors
    ///
    /// - `Error::WorkerNotFound` if neither the worker nor a default exists
    /// - `Error::RegistryClosed` after `shutdown`
    /// - any error from `ResilientExecutor::execute_with_retry`
    pub async fn try_dispatch(
        &self,
        worker_id: &WorkerId,
        request: WorkerRequest,
        cancel: &CancelToken,
    ) -> Result<Dispatched> {
        let route = self.route(worker_id)?;
        if route.fell_back {
            warn!(
                requested = %worker_id,
                used = %route.worker_id,
                "worker not registered, falling back to default worker"
            );
            self.emit(RegistryEvent::Fallback {
                requested: worker_id.clone(),
                used: route.worker_id.clone(),
            });
        }

        let _busy = BusyGuard::enter(self, &route.worker_id, route.generation);

        let _permit = tokio::select! {
            permit = Arc::clone(&route.queue).acquire_owned() => {
                permit.map_err(|_| Error::RegistryClosed)?
            }
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!(
                    "dispatch to {} cancelled while queued",
                    route.worker_id
                )));
            }
        };

        debug!(worker = %route.worker_id, "dispatching request");
        let worker = Arc::clone(&route.worker);
        let response = route
            .executor
            .execute_with_retry(cancel, |_attempt| {
                let worker = Arc::clone(&worker);
                let request = request.clone();
                async move {
                    let response = worker.execute(request).await?;
                    if response.status == ResponseStatus::Error {
                        return Err(WorkerError::from(response));
                    }
                    Ok(response)
                }
            })
            .await?;

        Ok(Dispatched {
            worker_id: route.worker_id,
            fell_back: route.fell_back,
            response,
        })
    }

    fn route(&self, requested: &WorkerId) -> Result<Route> {
        let state = self.state();
        if state.closed {
            return Err(Error::RegistryClosed);
        }

        let (record, fell_back) = match state.records.get(requested) {
            Some(record) => (record, false),
            None => {
                let fallback = self
                    .config
                    .default_worker
                    .as_ref()
                    .and_then(|id| state.records.get(id));
                match fallback {
                    Some(record) => (record, true),
                    None => {
                        return Err(Error::WorkerNotFound(match &self.config.default_worker {
                            Some(default) => format!(
                                "{} (default worker {} not registered either)",
                                requested, default
                            ),
                            None => format!("{} (no default worker configured)", requested),
                        }));
                    }
                }
            }
        };

        Ok(Route {
            worker_id: record.id.clone(),
            fell_back,
            generation: record.generation,
            worker: Arc::clone(&record.worker),
            executor: Arc::clone(&record.executor),
            queue: Arc::clone(&record.queue),
        })
    }

    /// Close the registry, drain in-flight dispatches and shut every worker down.
    pub async fn shutdown(&self) {
        let records: Vec<(WorkerId, Arc<dyn Worker>, Arc<Semaphore>)> = {
            let mut state = self.state();
            state.closed = true;
            state
                .order
                .iter()
                .filter_map(|id| state.records.get(id))
                .map(|r| (r.id.clone(), Arc::clone(&r.worker), Arc::clone(&r.queue)))
                .collect()
        };

        let permits = u32::try_from(self.config.max_concurrent_per_worker.max(1)).unwrap_or(u32::MAX);
        for (id, worker, queue) in records {
            // Holding every permit means nothing is in flight.
            match queue.acquire_many(permits).await {
                Ok(drained) => drained.forget(),
                Err(_) => debug!(worker = %id, "queue already closed"),
            }
            queue.close();
            worker.shutdown().await;
            debug!(worker = %id, "worker shut down");
        }

        {
            let mut state = self.state();
            state.records.clear();
            state.order.clear();
        }
        info!("worker registry shut down");
        self.emit(RegistryEvent::ShutDown);
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

/// Marks a worker busy for the lifetime of one dispatch.
struct BusyGuard<'a> {
    registry: &'a WorkerRegistry,
    worker_id: WorkerId,
    generation: u64,
}

impl<'a> BusyGuard<'a> {
    fn enter(registry: &'a WorkerRegistry, worker_id: &WorkerId, generation: u64) -> Self {
        let in_flight = {
            let mut state = registry.state();
            match state.records.get_mut(worker_id) {
                Some(record) if record.generation == generation => {
                    record.in_flight += 1;
                    record.status = WorkerStatus::Busy;
                    Some(record.in_flight)
                }
                _ => None,
            }
        };
        if let Some(in_flight) = in_flight {
            if in_flight > 1 {
                debug!(worker = %worker_id, in_flight, "worker busy, request queued");
            }
            registry.emit(RegistryEvent::Busy {
                worker_id: worker_id.clone(),
                in_flight,
            });
        }
        Self {
            registry,
            worker_id: worker_id.clone(),
            generation,
        }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let now_ready = {
            let mut state = self.registry.state();
            match state.records.get_mut(&self.worker_id) {
                Some(record) if record.generation == self.generation => {
                    record.in_flight = record.in_flight.saturating_sub(1);
                    if record.in_flight == 0 {
                        record.status = WorkerStatus::Ready;
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            }
        };
        if now_ready {
            self.registry.emit(RegistryEvent::Ready {
                worker_id: self.worker_id.clone(),
            });
        }
    }
}
