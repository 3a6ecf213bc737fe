//! Control channel tests.
//!
//! These tests drive `control::serve` with JSON lines and check the
//! messages written back, the way a client on stdin/stdout sees them.

use std::sync::Arc;

use serde_json::{json, Value};

use conductor::config::PlanConfig;
use conductor::control::{self, ChannelNotifier, ControlHandler, InboundMessage, OutboundMessage};
use conductor::orchestration::TemplateDecomposer;
use conductor::session::{ClientId, SessionController, SessionStatus};

use crate::fixtures::{RegistryHarness, ScriptedWorker};

struct Channel {
    handler: ControlHandler,
    notifier: Arc<ChannelNotifier>,
    workers: Vec<Arc<ScriptedWorker>>,
}

impl Channel {
    fn new() -> Self {
        let workers = vec![
            ScriptedWorker::new("general")
                .with_capabilities(&["analysis", "review"])
                .into_arc(),
            ScriptedWorker::new("coder")
                .with_capabilities(&["code", "testing"])
                .into_arc(),
        ];
        let registry = RegistryHarness::new(Some("general"), workers.clone()).registry;
        let decomposer = Arc::new(TemplateDecomposer::new(registry.clone(), PlanConfig::default()));
        let notifier = Arc::new(ChannelNotifier::new());
        let handler = ControlHandler::new(
            registry,
            decomposer,
            Arc::new(SessionController::default()),
            notifier.clone(),
        );
        Self {
            handler,
            notifier,
            workers,
        }
    }

    /// Feed `lines` to the handler and collect everything written back.
    async fn exchange(&self, client: &str, lines: &[Value]) -> Vec<Value> {
        let input: String = lines.iter().map(|l| format!("{}\n", l)).collect();
        let outbound = self.notifier.attach();
        let mut output = Vec::new();
        control::serve(
            &self.handler,
            &ClientId::from(client),
            input.as_bytes(),
            outbound,
            &mut output,
        )
        .await
        .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

fn types(messages: &[Value]) -> Vec<&str> {
    messages
        .iter()
        .map(|m| m["type"].as_str().unwrap_or(""))
        .collect()
}

/// Test: Explicit workflow over the wire
/// Given a workflow message with three subtasks on two workers
/// Then the client sees thinking, progress and one final response
#[tokio::test]
async fn test_workflow_with_explicit_subtasks() {
    let channel = Channel::new();
    let workflow = json!({
        "type": "workflow",
        "goal": "ship the feature",
        "subtasks": [
            {"id": "design", "description": "design it", "worker_id": "general", "estimated_duration": 2.0},
            {"id": "build", "description": "build it", "worker_id": "coder", "dependencies": ["design"], "estimated_duration": 5.0},
            {"id": "check", "description": "check it", "worker_id": "general", "dependencies": ["build"], "estimated_duration": 1.0}
        ]
    });

    let out = channel.exchange("c1", &[workflow]).await;

    assert_eq!(out[0]["type"], "agent_thinking");
    assert_eq!(out[0]["subtasks"], 3);
    assert_eq!(out[0]["mode"], "parallel");
    assert!(types(&out).contains(&"agent_progress"));

    let last = out.last().unwrap();
    assert_eq!(last["type"], "agent_response");
    assert_eq!(last["data"]["outcome"], "completed");
    assert_eq!(last["data"]["results"].as_array().unwrap().len(), 3);
    assert_eq!(last["data"]["critical_path"], 8.0);

    assert_eq!(channel.workers[1].instructions(), vec!["build it".to_string()]);
    assert_eq!(
        channel
            .handler
            .sessions()
            .status(&ClientId::from("c1"))
            .await,
        None,
        "delivered results are purged"
    );
}

/// Test: Chat goals are decomposed from templates
#[tokio::test]
async fn test_chat_goal_uses_capability_routing() {
    let channel = Channel::new();
    let chat = json!({
        "type": "chat",
        "message": "add retry logic to the uploader and cover the new paths"
    });

    let out = channel.exchange("c1", &[chat]).await;

    assert_eq!(out[0]["type"], "agent_thinking");
    assert_eq!(out[0]["complexity"], "medium");
    assert_eq!(out.last().unwrap()["type"], "agent_response");
    assert_eq!(channel.workers[1].calls(), 1, "implementation stage goes to the coder");
}

/// Test: A malformed graph is an error and nothing runs
#[tokio::test]
async fn test_decomposition_error_over_the_wire() {
    let channel = Channel::new();
    let workflow = json!({
        "type": "workflow",
        "goal": "broken",
        "subtasks": [
            {"id": "a", "description": "a", "worker_id": "general", "dependencies": ["missing"]}
        ]
    });

    let out = channel.exchange("c1", &[workflow]).await;

    assert_eq!(types(&out), vec!["error"]);
    assert_eq!(out[0]["kind"], "decomposition");
    assert!(channel.workers.iter().all(|w| w.calls() == 0));
}

/// Test: Ping, status, stop and unknown commands
#[tokio::test]
async fn test_housekeeping_messages() {
    let channel = Channel::new();
    let out = channel
        .exchange(
            "c1",
            &[
                json!({"type": "ping"}),
                json!({"type": "command", "name": "status"}),
                json!({"type": "stop"}),
                json!({"type": "command", "name": "reboot"}),
                json!({"type": "nonsense"}),
            ],
        )
        .await;

    assert_eq!(
        types(&out),
        vec!["pong", "agent_response", "stopped", "error", "error"]
    );
    assert_eq!(out[1]["data"]["workers"].as_array().unwrap().len(), 2);
    assert_eq!(out[2]["cancelled"], 0);
    assert_eq!(out[3]["kind"], "unknown_command");
    assert_eq!(out[4]["kind"], "json");
}

/// Test: A result produced while the client was away is restored on connect
#[tokio::test]
async fn test_result_restored_on_next_connect() {
    let channel = Channel::new();
    let client = ClientId::from("c1");

    // No receiver attached: the final response cannot be delivered.
    channel
        .handler
        .handle(
            &client,
            InboundMessage::Chat {
                message: "fix the typo".into(),
            },
        )
        .await;
    channel.handler.wait_idle(&client).await;
    assert_eq!(
        channel.handler.sessions().status(&client).await,
        Some(SessionStatus::Completed)
    );

    let out = channel.exchange("c1", &[]).await;

    assert_eq!(types(&out), vec!["session_restore"]);
    assert_eq!(out[0]["status"], "completed");
    assert_eq!(out[0]["result"]["outcome"], "completed");

    let again = channel.exchange("c1", &[]).await;
    assert!(again.is_empty());
}

#[test]
fn test_outbound_error_carries_kind() {
    let err = conductor::Error::SessionExists("c1".into());
    assert_eq!(
        OutboundMessage::error(&err),
        OutboundMessage::Error {
            message: "Session already running: c1".into(),
            kind: "session_exists".into(),
        }
    );
}
