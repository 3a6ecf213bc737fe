//! Client control channel.
//!
//! Clients talk to Conductor with JSON messages internally tagged by
//! `type`. Inbound messages start goals, stop them, query state, or ping.
//! Outbound messages carry progress, results, and errors back through an
//! injected [`Notifier`], so the same handler serves stdin/stdout, tests,
//! or any other transport.
//!
//! A goal runs as a tracked task holding a child of the client's cancel
//! token. Its final report is stored on the session before delivery; if the
//! client is unreachable at that moment the report waits for the next
//! [`ControlHandler::connect`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::dag::{Complexity, ExecutionMode, TaskGraph};
use crate::core::task::SubtaskSpec;
use crate::error::{Error, Result};
use crate::orchestration::orchestrator::{ExecutionReport, Orchestrator};
use crate::orchestration::planner::{plan_goal, Decomposer};
use crate::orchestration::registry::WorkerRegistry;
use crate::orchestration::scheduler::TaskGraphScheduler;
use crate::session::{ClientId, InFlight, ReconnectOutcome, SessionController, SessionStatus};

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Free-form goal; complexity is assessed from the text.
    Chat { message: String },
    /// Named query such as `status` or `workers`.
    Command { name: String },
    /// Goal with an optional complexity and optional explicit subtasks.
    Workflow {
        goal: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        complexity: Option<Complexity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtasks: Option<Vec<SubtaskSpec>>,
    },
    Stop,
    Ping,
}

/// Messages sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// A goal was accepted and planned.
    AgentThinking {
        goal: String,
        complexity: Complexity,
        mode: ExecutionMode,
        subtasks: usize,
    },
    AgentProgress { message: String },
    /// Final answer to a goal or a command.
    AgentResponse { content: String, data: Value },
    /// Reply to `stop`: how many in-flight tasks were signalled.
    Stopped { cancelled: usize },
    Error { message: String, kind: String },
    Pong,
    /// Sent on connect when the client has a session.
    SessionRestore {
        goal: String,
        status: SessionStatus,
        progress: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
}

impl OutboundMessage {
    pub fn error(err: &Error) -> Self {
        OutboundMessage::Error {
            message: err.to_string(),
            kind: err.kind().to_string(),
        }
    }
}

/// Delivers outbound messages to clients.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns false when the client could not be reached.
    async fn notify(&self, client: &ClientId, message: OutboundMessage) -> bool;
}

/// Notifier for a single attached client, backed by an unbounded channel.
///
/// Dropping the receiver (or calling `detach`) makes the client
/// unreachable until the next `attach`.
#[derive(Debug, Default)]
pub struct ChannelNotifier {
    tx: Mutex<Option<mpsc::UnboundedSender<OutboundMessage>>>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a fresh receiver, replacing any previous one.
    pub fn attach(&self) -> mpsc::UnboundedReceiver<OutboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    pub fn detach(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_attached(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, client: &ClientId, message: OutboundMessage) -> bool {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match tx {
            Some(tx) => tx.send(message).is_ok(),
            None => {
                debug!(client = %client, "no receiver attached, message dropped");
                false
            }
        }
    }
}

/// Implements the control-channel message semantics.
#[derive(Clone)]
pub struct ControlHandler {
    registry: Arc<WorkerRegistry>,
    decomposer: Arc<dyn Decomposer>,
    sessions: Arc<SessionController>,
    notifier: Arc<dyn Notifier>,
    runs: Arc<Mutex<HashMap<ClientId, JoinHandle<()>>>>,
}

impl ControlHandler {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        decomposer: Arc<dyn Decomposer>,
        sessions: Arc<SessionController>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            decomposer,
            sessions,
            notifier,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionController> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// A client connected or reconnected.
    ///
    /// A running session is restored with its recent progress. A result
    /// that finished while the client was away is delivered once.
    pub async fn connect(&self, client: &ClientId) {
        let restore = match self.sessions.on_reconnect(client).await {
            ReconnectOutcome::Running { goal, progress } => OutboundMessage::SessionRestore {
                goal,
                status: SessionStatus::Running,
                progress: progress.into_iter().map(|p| p.message).collect(),
                result: None,
            },
            ReconnectOutcome::Completed { goal, result } => OutboundMessage::SessionRestore {
                goal,
                status: SessionStatus::Completed,
                progress: Vec::new(),
                result: Some(result),
            },
            ReconnectOutcome::NoSession => return,
        };
        info!(client = %client, "restoring session");
        self.send(client, restore).await;
    }

    /// Parse one JSON line and handle it. Malformed input is answered with an `error`.
    pub async fn handle_line(&self, client: &ClientId, line: &str) {
        match serde_json::from_str::<InboundMessage>(line) {
            Ok(message) => self.handle(client, message).await,
            Err(e) => {
                debug!(client = %client, "unparseable message: {}", e);
                self.send(client, OutboundMessage::error(&Error::Json(e))).await;
            }
        }
    }

    pub async fn handle(&self, client: &ClientId, message: InboundMessage) {
        match message {
            InboundMessage::Chat { message } => self.start_goal(client, &message, None, None).await,
            InboundMessage::Workflow {
                goal,
                complexity,
                subtasks,
            } => self.start_goal(client, &goal, complexity, subtasks).await,
            InboundMessage::Command { name } => self.command(client, &name).await,
            InboundMessage::Stop => {
                let cancelled = self.sessions.cancel(client).await;
                self.send(client, OutboundMessage::Stopped { cancelled }).await;
            }
            InboundMessage::Ping => {
                self.send(client, OutboundMessage::Pong).await;
            }
        }
    }

    /// Wait for the client's current run, if any, to finish.
    pub async fn wait_idle(&self, client: &ClientId) {
        let handle = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client);
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(client = %client, "run task failed: {}", e);
            }
        }
    }

    async fn send(&self, client: &ClientId, message: OutboundMessage) -> bool {
        self.notifier.notify(client, message).await
    }

    async fn start_goal(
        &self,
        client: &ClientId,
        goal: &str,
        complexity: Option<Complexity>,
        subtasks: Option<Vec<SubtaskSpec>>,
    ) {
        if self.sessions.status(client).await == Some(SessionStatus::Running) {
            let err = Error::SessionExists(client.to_string());
            self.send(client, OutboundMessage::error(&err)).await;
            return;
        }

        let graph = match self.plan(goal, complexity, subtasks).await {
            Ok(graph) => graph,
            Err(e) => {
                warn!(client = %client, "goal rejected: {}", e);
                self.send(client, OutboundMessage::error(&e)).await;
                return;
            }
        };

        let in_flight = match self.open_session(client, goal).await {
            Ok(in_flight) => in_flight,
            Err(e) => {
                self.send(client, OutboundMessage::error(&e)).await;
                return;
            }
        };

        self.send(
            client,
            OutboundMessage::AgentThinking {
                goal: goal.to_string(),
                complexity: graph.complexity(),
                mode: graph.mode(),
                subtasks: graph.len(),
            },
        )
        .await;

        let handle = self.clone().spawn_run(client.clone(), graph, in_flight);
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(client.clone(), handle);
    }

    async fn plan(
        &self,
        goal: &str,
        complexity: Option<Complexity>,
        subtasks: Option<Vec<SubtaskSpec>>,
    ) -> Result<TaskGraph> {
        match subtasks {
            Some(specs) => {
                let complexity = complexity.unwrap_or_else(|| Complexity::assess(goal));
                TaskGraphScheduler::build(goal, complexity, specs)
            }
            None => plan_goal(self.decomposer.as_ref(), goal, complexity).await,
        }
    }

    async fn open_session(&self, client: &ClientId, goal: &str) -> Result<InFlight> {
        self.sessions.start_session(client, goal).await?;
        self.sessions.track(client).await
    }

    fn spawn_run(self, client: ClientId, mut graph: TaskGraph, in_flight: InFlight) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (event_tx, mut event_rx) = mpsc::unbounded_channel();
            let orchestrator = Orchestrator::new(self.registry.clone()).with_events(event_tx);
            let token = in_flight.token.clone();

            let run = async move {
                let report = orchestrator.execute(&mut graph, &token).await;
                drop(orchestrator);
                report
            };
            let forward = async {
                while let Some(event) = event_rx.recv().await {
                    let message = event.describe();
                    if let Err(e) = self.sessions.record_progress(&client, message.clone()).await {
                        debug!(client = %client, "progress not recorded: {}", e);
                    }
                    self.send(&client, OutboundMessage::AgentProgress { message })
                        .await;
                }
            };
            let (report, ()) = tokio::join!(run, forward);

            self.sessions.untrack(&client, in_flight.id).await;
            self.finish(&client, report).await;
        })
    }

    async fn finish(&self, client: &ClientId, report: ExecutionReport) {
        let content = report.combined_content();
        let data = match serde_json::to_value(&report) {
            Ok(data) => data,
            Err(e) => {
                warn!(client = %client, "report not serializable: {}", e);
                json!({ "outcome": report.outcome, "error": e.to_string() })
            }
        };

        if let Err(e) = self.sessions.complete_session(client, data.clone()).await {
            warn!(client = %client, "session not completed: {}", e);
            return;
        }

        if self
            .send(client, OutboundMessage::AgentResponse { content, data })
            .await
        {
            self.sessions.deliver_result(client).await;
        } else {
            info!(client = %client, "client unreachable, result kept for reconnect");
        }
    }

    async fn command(&self, client: &ClientId, name: &str) {
        let reply = match name.trim() {
            "status" => {
                let workers = self.registry.snapshot();
                let session = self.sessions.session(client).await;
                let content = match &session {
                    Some(s) => format!("{} worker(s), session {}: {}", workers.len(), s.status, s.goal),
                    None => format!("{} worker(s), no session", workers.len()),
                };
                OutboundMessage::AgentResponse {
                    content,
                    data: json!({
                        "workers": workers,
                        "session": session.map(|s| json!({
                            "goal": s.goal,
                            "status": s.status,
                            "progress": s.progress.len(),
                        })),
                    }),
                }
            }
            "workers" => {
                let workers = self.registry.snapshot();
                let content = workers
                    .iter()
                    .map(|w| {
                        format!(
                            "{} [{}] {} circuit={}",
                            w.id, w.capabilities, w.status, w.circuit.state
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                OutboundMessage::AgentResponse {
                    content,
                    data: json!({ "workers": workers }),
                }
            }
            other => OutboundMessage::Error {
                message: format!("Unknown command: {}", other),
                kind: "unknown_command".to_string(),
            },
        };
        self.send(client, reply).await;
    }
}

/// Serve one client over a JSON-lines transport until the reader closes.
///
/// Runs still in progress when input ends are awaited and their final
/// messages flushed before returning.
pub async fn serve<R, W>(
    handler: &ControlHandler,
    client: &ClientId,
    reader: R,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    mut writer: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    handler.connect(client).await;
    let mut lines = reader.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !line.trim().is_empty() {
                            handler.handle_line(client, &line).await;
                        }
                    }
                    None => break,
                }
            }
            Some(message) = outbound.recv() => write_message(&mut writer, &message).await?,
        }
    }

    debug!(client = %client, "input closed, waiting for run to finish");
    handler.wait_idle(client).await;
    while let Ok(message) = outbound.try_recv() {
        write_message(&mut writer, &message).await?;
    }
    writer.flush().await?;
    Ok(())
}

async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &OutboundMessage) -> Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
