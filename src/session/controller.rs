//! Per-client session tracking.
//!
//! A client owns at most one session at a time. While it runs, progress is
//! appended to an ordered log capped at the replay limit; a reconnecting
//! client is replayed those entries. The final result is set once, delivered at most once and
//! then purged. Every task spawned for the client holds a child of the
//! client's [`CancelToken`] and is tracked until it finishes, so a `stop`
//! reaches all of them.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::cancel::CancelToken;
use crate::{Error, Result};

/// Progress entries replayed to a reconnecting client.
pub const DEFAULT_PROGRESS_REPLAY: usize = 10;

/// Identifier of a control-channel client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// One run on behalf of a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSession {
    pub client_id: ClientId,
    pub goal: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent progress, oldest first.
    pub progress: VecDeque<ProgressEntry>,
    /// Final result. Set once by `complete_session`.
    pub result: Option<Value>,
}

impl ClientSession {
    fn new(client_id: ClientId, goal: &str) -> Self {
        Self {
            client_id,
            goal: goal.to_string(),
            status: SessionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            progress: VecDeque::new(),
            result: None,
        }
    }

    fn recent_progress(&self, limit: usize) -> Vec<ProgressEntry> {
        let skip = self.progress.len().saturating_sub(limit);
        self.progress.iter().skip(skip).cloned().collect()
    }
}

/// What a reconnecting client should be shown.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectOutcome {
    /// Session still running: the most recent progress entries.
    Running {
        goal: String,
        progress: Vec<ProgressEntry>,
    },
    /// Session finished while the client was away. The session is purged.
    Completed { goal: String, result: Value },
    NoSession,
}

/// A tracked in-flight task and the token it must observe.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub id: Uuid,
    pub token: CancelToken,
}

struct ClientState {
    session: Option<ClientSession>,
    token: CancelToken,
    in_flight: HashMap<Uuid, CancelToken>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            session: None,
            token: CancelToken::new(),
            in_flight: HashMap::new(),
        }
    }
}

/// Session registry keyed by client id.
pub struct SessionController {
    clients: RwLock<HashMap<ClientId, ClientState>>,
    replay_limit: usize,
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_REPLAY)
    }
}

impl SessionController {
    pub fn new(replay_limit: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            replay_limit,
        }
    }

    /// Open a running session for `client` and return its cancel token.
    ///
    /// A token that was cancelled by a previous `stop` is replaced with a
    /// fresh one. An undelivered result from an earlier session is dropped.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionExists` if the client already has a running session.
    pub async fn start_session(&self, client: &ClientId, goal: &str) -> Result<CancelToken> {
        let mut clients = self.clients.write().await;
        let state = clients.entry(client.clone()).or_insert_with(ClientState::new);

        match &state.session {
            Some(session) if session.status == SessionStatus::Running => {
                return Err(Error::SessionExists(client.to_string()));
            }
            Some(session) if session.result.is_some() => {
                debug!(client = %client, goal = %session.goal, "dropping undelivered result");
            }
            _ => {}
        }

        if state.token.is_cancelled() {
            state.token = CancelToken::new();
        }
        state.session = Some(ClientSession::new(client.clone(), goal));
        info!(client = %client, "session started: {}", goal);
        Ok(state.token.clone())
    }

    /// Append a progress entry to the running session.
    pub async fn record_progress(&self, client: &ClientId, message: impl Into<String>) -> Result<()> {
        let mut clients = self.clients.write().await;
        let session = clients
            .get_mut(client)
            .and_then(|s| s.session.as_mut())
            .ok_or_else(|| Error::SessionNotFound(client.to_string()))?;
        if session.status == SessionStatus::Completed {
            return Err(Error::SessionCompleted(client.to_string()));
        }
        session.progress.push_back(ProgressEntry {
            at: Utc::now(),
            message: message.into(),
        });
        while session.progress.len() > self.replay_limit {
            session.progress.pop_front();
        }
        Ok(())
    }

    /// Store the final result. Allowed once per session.
    pub async fn complete_session(&self, client: &ClientId, result: Value) -> Result<()> {
        let mut clients = self.clients.write().await;
        let session = clients
            .get_mut(client)
            .and_then(|s| s.session.as_mut())
            .ok_or_else(|| Error::SessionNotFound(client.to_string()))?;
        if session.status == SessionStatus::Completed {
            return Err(Error::SessionCompleted(client.to_string()));
        }
        session.status = SessionStatus::Completed;
        session.completed_at = Some(Utc::now());
        session.result = Some(result);
        info!(client = %client, "session completed");
        Ok(())
    }

    /// Handle a client (re)connecting.
    pub async fn on_reconnect(&self, client: &ClientId) -> ReconnectOutcome {
        let mut clients = self.clients.write().await;
        let Some(state) = clients.get_mut(client) else {
            return ReconnectOutcome::NoSession;
        };
        if let Some(session) = state
            .session
            .as_ref()
            .filter(|s| s.status == SessionStatus::Running)
        {
            return ReconnectOutcome::Running {
                goal: session.goal.clone(),
                progress: session.recent_progress(self.replay_limit),
            };
        }
        match take_result(&mut state.session) {
            Some((goal, result)) => {
                debug!(client = %client, "delivering stored result on reconnect");
                ReconnectOutcome::Completed { goal, result }
            }
            None => ReconnectOutcome::NoSession,
        }
    }

    /// Take the final result after it was delivered live, purging the session.
    pub async fn deliver_result(&self, client: &ClientId) -> Option<Value> {
        let mut clients = self.clients.write().await;
        let state = clients.get_mut(client)?;
        let completed = state
            .session
            .as_ref()
            .is_some_and(|s| s.status == SessionStatus::Completed);
        if !completed {
            return None;
        }
        take_result(&mut state.session).map(|(_, result)| result)
    }

    /// Cancel the client's token and every tracked in-flight task.
    ///
    /// Returns how many in-flight tasks were signalled.
    pub async fn cancel(&self, client: &ClientId) -> usize {
        let mut clients = self.clients.write().await;
        let Some(state) = clients.get_mut(client) else {
            return 0;
        };
        state.token.cancel();
        let count = state.in_flight.len();
        for (_, token) in state.in_flight.drain() {
            token.cancel();
        }
        info!(client = %client, in_flight = count, "session cancelled");
        count
    }

    /// Register an in-flight task. Its token is a child of the client token.
    pub async fn track(&self, client: &ClientId) -> Result<InFlight> {
        let mut clients = self.clients.write().await;
        let state = clients
            .get_mut(client)
            .ok_or_else(|| Error::SessionNotFound(client.to_string()))?;
        let entry = InFlight {
            id: Uuid::new_v4(),
            token: state.token.child(),
        };
        state.in_flight.insert(entry.id, entry.token.clone());
        Ok(entry)
    }

    /// Remove a finished task. Returns false if it was not tracked.
    pub async fn untrack(&self, client: &ClientId, id: Uuid) -> bool {
        let mut clients = self.clients.write().await;
        clients
            .get_mut(client)
            .is_some_and(|s| s.in_flight.remove(&id).is_some())
    }

    pub async fn in_flight_count(&self, client: &ClientId) -> usize {
        let clients = self.clients.read().await;
        clients.get(client).map_or(0, |s| s.in_flight.len())
    }

    pub async fn cancel_token(&self, client: &ClientId) -> Option<CancelToken> {
        let clients = self.clients.read().await;
        clients.get(client).map(|s| s.token.clone())
    }

    pub async fn status(&self, client: &ClientId) -> Option<SessionStatus> {
        let clients = self.clients.read().await;
        clients.get(client)?.session.as_ref().map(|s| s.status)
    }

    /// A copy of the client's current session.
    pub async fn session(&self, client: &ClientId) -> Option<ClientSession> {
        let clients = self.clients.read().await;
        clients.get(client)?.session.clone()
    }

    /// The client is gone for good: cancel its work and drop all state.
    pub async fn forget(&self, client: &ClientId) -> bool {
        let mut clients = self.clients.write().await;
        match clients.remove(client) {
            Some(state) => {
                state.token.cancel();
                for token in state.in_flight.values() {
                    token.cancel();
                }
                debug!(client = %client, "session state forgotten");
                true
            }
            None => false,
        }
    }
}

fn take_result(session: &mut Option<ClientSession>) -> Option<(String, Value)> {
    let mut taken = session.take()?;
    let result = taken.result.take()?;
    Some((taken.goal, result))
}
