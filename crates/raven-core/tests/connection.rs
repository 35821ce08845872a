//! End-to-end tests over an in-memory transport with a scripted agent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use raven_core::acp::{
    AcpConnection, ChannelTransport, ConnectionOptions, FileSystem, MessagePart,
    PermissionDecider, Role, SessionNotification, TerminalManager, Transport,
};
use raven_core::error::{AcpError, Error, Result};
use raven_core::types::{
    ContentBlock, RequestPermissionParams, StopReason, TerminalCreateParams, TerminalCreateResult,
    TerminalExitStatus, TerminalOutputResult,
};

struct NoFs;

#[async_trait]
impl FileSystem for NoFs {
    async fn read_file(&self, _: &std::path::Path) -> Result<String> {
        Err(std::io::Error::from(std::io::ErrorKind::NotFound).into())
    }
    async fn write_file(&self, _: &std::path::Path, _: &str) -> Result<()> {
        Ok(())
    }
}

struct NoTerminals;

#[async_trait]
impl TerminalManager for NoTerminals {
    async fn create(&self, _: TerminalCreateParams) -> Result<TerminalCreateResult> {
        Err(AcpError::TerminalNotFound("disabled".to_string()).into())
    }
    async fn output(&self, _: &str, t: &str) -> Result<TerminalOutputResult> {
        Err(AcpError::TerminalNotFound(t.to_string()).into())
    }
    async fn wait_for_exit(&self, _: &str, t: &str) -> Result<TerminalExitStatus> {
        Err(AcpError::TerminalNotFound(t.to_string()).into())
    }
    async fn kill(&self, _: &str, t: &str) -> Result<()> {
        Err(AcpError::TerminalNotFound(t.to_string()).into())
    }
    async fn release(&self, _: &str, t: &str) -> Result<()> {
        Err(AcpError::TerminalNotFound(t.to_string()).into())
    }
}

/// Picks a named option, recording what it was asked.
struct ScriptedDecider {
    pick: String,
    asked: Mutex<Vec<RequestPermissionParams>>,
}

#[async_trait]
impl PermissionDecider for ScriptedDecider {
    async fn decide(&self, request: RequestPermissionParams) -> Option<String> {
        self.asked.lock().await.push(request);
        Some(self.pick.clone())
    }
}

struct FakeAgent {
    transport: ChannelTransport,
}

impl FakeAgent {
    async fn recv(&self) -> serde_json::Value {
        let frame = self
            .transport
            .recv()
            .await
            .expect("agent side closed unexpectedly");
        serde_json::from_str(&frame).unwrap()
    }

    async fn send(&self, value: serde_json::Value) {
        self.transport.send(value.to_string()).await.unwrap();
    }

    async fn respond(&self, id: &serde_json::Value, result: serde_json::Value) {
        self.send(serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            .await;
    }

    async fn update(&self, session_id: &str, update: serde_json::Value) {
        self.send(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": { "sessionId": session_id, "update": update }
        }))
        .await;
    }

    /// Serve `initialize` and `session/new` with stock answers.
    async fn handshake(&self, session_id: &str) {
        let init = self.recv().await;
        assert_eq!(init["method"], "initialize");
        assert_eq!(init["params"]["protocolVersion"], 1);
        assert_eq!(init["params"]["clientCapabilities"]["fs"]["readTextFile"], true);
        self.respond(
            &init["id"],
            serde_json::json!({
                "protocolVersion": 1,
                "agentInfo": { "name": "fake-agent", "version": "0.0.1" },
                "agentCapabilities": { "loadSession": true }
            }),
        )
        .await;

        let new = self.recv().await;
        assert_eq!(new["method"], "session/new");
        self.respond(&new["id"], serde_json::json!({ "sessionId": session_id }))
            .await;
    }
}

fn connect(
    decider: Arc<dyn PermissionDecider>,
) -> (Arc<AcpConnection>, FakeAgent) {
    let (ours, theirs) = ChannelTransport::pair(64);
    let connection = AcpConnection::new(
        Arc::new(ours),
        ConnectionOptions::new("/work"),
        Arc::new(NoFs),
        Arc::new(NoTerminals),
        decider,
    );
    (connection, FakeAgent { transport: theirs })
}

fn allow_first() -> Arc<ScriptedDecider> {
    Arc::new(ScriptedDecider {
        pick: "allow".to_string(),
        asked: Mutex::new(Vec::new()),
    })
}

#[tokio::test]
async fn prompt_turn_streams_into_transcript() {
    let (connection, agent) = connect(allow_first());

    let driver = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection.initialize().await?;
            connection.session_new().await?;
            connection
                .session_prompt(vec![ContentBlock::text("hi")])
                .await
        }
    });

    agent.handshake("sess_1").await;

    let prompt = agent.recv().await;
    assert_eq!(prompt["method"], "session/prompt");
    assert_eq!(prompt["params"]["sessionId"], "sess_1");
    assert_eq!(prompt["params"]["prompt"][0]["text"], "hi");

    agent
        .update(
            "sess_1",
            serde_json::json!({
                "sessionUpdate": "agent_message_chunk",
                "content": { "type": "text", "text": "Hello" }
            }),
        )
        .await;
    agent
        .update(
            "sess_1",
            serde_json::json!({
                "sessionUpdate": "agent_message_chunk",
                "content": { "type": "text", "text": " there" }
            }),
        )
        .await;
    agent
        .respond(&prompt["id"], serde_json::json!({ "stopReason": "end_turn" }))
        .await;

    let stop = driver.await.unwrap().unwrap();
    assert_eq!(stop, StopReason::EndTurn);

    let transcript = connection.transcript().await;
    assert_eq!(transcript.len(), 1);
    assert_eq!(transcript[0].role, Role::Assistant);
    assert_eq!(transcript[0].content, "Hello there");
    assert_eq!(
        transcript[0].parts,
        vec![MessagePart::Text {
            text: "Hello there".to_string()
        }]
    );
}

#[tokio::test]
async fn permission_request_is_answered_and_folded() {
    let decider = Arc::new(ScriptedDecider {
        pick: "reject".to_string(),
        asked: Mutex::new(Vec::new()),
    });
    let (connection, agent) = connect(decider.clone());

    let driver = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection.initialize().await?;
            connection.session_new().await?;
            connection
                .session_prompt(vec![ContentBlock::text("delete the cache")])
                .await
        }
    });

    agent.handshake("sess_1").await;
    let prompt = agent.recv().await;

    // Agent asks before touching anything.
    agent
        .send(serde_json::json!({
            "jsonrpc": "2.0",
            "id": 100,
            "method": "session/request_permission",
            "params": {
                "sessionId": "sess_1",
                "toolCall": {
                    "toolCallId": "tc_rm",
                    "title": "Remove cache directory",
                    "kind": "delete",
                    "status": "pending"
                },
                "options": [
                    { "optionId": "allow", "name": "Allow", "kind": "allow_once" },
                    { "optionId": "reject", "name": "Reject", "kind": "reject_once" }
                ]
            }
        }))
        .await;

    let answer = agent.recv().await;
    assert_eq!(answer["id"], 100);
    assert_eq!(answer["result"]["outcome"]["outcome"], "selected");
    assert_eq!(answer["result"]["outcome"]["optionId"], "reject");

    // The tool call is already in the transcript, status pending.
    let transcript = connection.transcript().await;
    assert_eq!(transcript.len(), 1);
    match &transcript[0].parts[0] {
        MessagePart::ToolCall(part) => {
            assert_eq!(part.tool_call_id, "tc_rm");
            assert_eq!(part.title.as_deref(), Some("Remove cache directory"));
        }
        other => panic!("unexpected part: {:?}", other),
    }
    assert_eq!(decider.asked.lock().await.len(), 1);

    agent
        .respond(&prompt["id"], serde_json::json!({ "stopReason": "refusal" }))
        .await;
    assert_eq!(driver.await.unwrap().unwrap(), StopReason::Refusal);
}

#[tokio::test]
async fn tool_call_updates_merge_without_reordering() {
    let (connection, agent) = connect(allow_first());

    let driver = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection.initialize().await?;
            connection.session_new().await?;
            connection
                .session_prompt(vec![ContentBlock::text("run the tests")])
                .await
        }
    });

    agent.handshake("sess_1").await;
    let prompt = agent.recv().await;

    agent
        .update(
            "sess_1",
            serde_json::json!({
                "sessionUpdate": "tool_call",
                "toolCallId": "tc_test",
                "title": "Running tests",
                "kind": "execute",
                "status": "in_progress"
            }),
        )
        .await;
    agent
        .update(
            "sess_1",
            serde_json::json!({
                "sessionUpdate": "agent_message_chunk",
                "content": { "type": "text", "text": "Tests are running." }
            }),
        )
        .await;
    agent
        .update(
            "sess_1",
            serde_json::json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "tc_test",
                "status": "completed",
                "rawOutput": { "passed": 12 }
            }),
        )
        .await;
    agent
        .respond(&prompt["id"], serde_json::json!({ "stopReason": "end_turn" }))
        .await;

    driver.await.unwrap().unwrap();

    // The text chunk lands on the tool-call message itself; the later
    // update mutates the part in place without appending anything.
    let transcript = connection.transcript().await;
    assert_eq!(transcript.len(), 1);
    match &transcript[0].parts[0] {
        MessagePart::ToolCall(part) => {
            assert_eq!(
                part.status,
                raven_core::types::ToolCallStatus::Completed
            );
            assert_eq!(part.raw_output, Some(serde_json::json!({ "passed": 12 })));
        }
        other => panic!("unexpected part: {:?}", other),
    }
    assert_eq!(
        transcript[0].parts[1],
        MessagePart::Text {
            text: "Tests are running.".to_string()
        }
    );
}

#[tokio::test]
async fn disconnect_rejects_pending_prompt_and_notifies() {
    let (connection, agent) = connect(allow_first());
    let mut events = connection.subscribe();

    let driver = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection.initialize().await?;
            connection.session_new().await?;
            connection
                .session_prompt(vec![ContentBlock::text("hi")])
                .await
        }
    });

    agent.handshake("sess_1").await;
    let _prompt = agent.recv().await;

    // Agent dies mid-turn.
    agent.transport.close().await;

    let err = driver.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Acp(AcpError::ConnectionClosed)));

    // Subscribers hear about it.
    let deadline = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(SessionNotification::Disconnected) => break,
                Ok(_) => continue,
                Err(e) => panic!("notification channel failed: {}", e),
            }
        }
    });
    deadline.await.expect("no disconnect notification");
}

#[tokio::test]
async fn cancel_sends_notification_and_turn_resolves_cancelled() {
    let (connection, agent) = connect(allow_first());

    let driver = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection.initialize().await?;
            connection.session_new().await?;
            connection
                .session_prompt(vec![ContentBlock::text("long job")])
                .await
        }
    });

    agent.handshake("sess_1").await;
    let prompt = agent.recv().await;

    connection.session_cancel().await.unwrap();

    let cancel = agent.recv().await;
    assert_eq!(cancel["method"], "session/cancel");
    assert!(cancel.get("id").is_none());
    assert_eq!(cancel["params"]["sessionId"], "sess_1");

    agent
        .respond(&prompt["id"], serde_json::json!({ "stopReason": "cancelled" }))
        .await;
    assert_eq!(driver.await.unwrap().unwrap(), StopReason::Cancelled);
}

#[tokio::test]
async fn session_new_is_idempotent() {
    let (connection, agent) = connect(allow_first());

    let driver = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection.initialize().await?;
            let first = connection.session_new().await?;
            let second = connection.session_new().await?;
            Ok::<_, Error>((first, second))
        }
    });

    agent.handshake("sess_1").await;
    // No second session/new frame arrives; the driver finishes on its own.
    let (first, second) = driver.await.unwrap().unwrap();
    assert_eq!(first, "sess_1");
    assert_eq!(second, "sess_1");
}

#[tokio::test]
async fn set_mode_and_set_model_update_session_metadata() {
    let (connection, agent) = connect(allow_first());

    let driver = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection.initialize().await?;
            connection.session_new().await?;
            connection.set_mode("plan").await?;
            connection.set_model("fast").await?;
            Ok::<_, Error>(())
        }
    });

    agent.handshake("sess_1").await;

    let set_mode = agent.recv().await;
    assert_eq!(set_mode["method"], "session/set_mode");
    assert_eq!(set_mode["params"]["sessionId"], "sess_1");
    assert_eq!(set_mode["params"]["modeId"], "plan");
    agent.respond(&set_mode["id"], serde_json::json!({})).await;

    let set_model = agent.recv().await;
    assert_eq!(set_model["method"], "session/set_model");
    assert_eq!(set_model["params"]["sessionId"], "sess_1");
    assert_eq!(set_model["params"]["modelId"], "fast");
    agent.respond(&set_model["id"], serde_json::json!({})).await;

    driver.await.unwrap().unwrap();
    assert_eq!(connection.current_mode_id().await.as_deref(), Some("plan"));
    assert_eq!(connection.current_model_id().await.as_deref(), Some("fast"));
}

#[tokio::test]
async fn replayed_history_rebuilds_transcript_on_load() {
    let (connection, agent) = connect(allow_first());

    let driver = tokio::spawn({
        let connection = connection.clone();
        async move {
            connection.initialize().await?;
            connection.session_load("sess_old").await
        }
    });

    let init = agent.recv().await;
    agent
        .respond(
            &init["id"],
            serde_json::json!({
                "protocolVersion": 1,
                "agentCapabilities": { "loadSession": true }
            }),
        )
        .await;

    let load = agent.recv().await;
    assert_eq!(load["method"], "session/load");
    assert_eq!(load["params"]["sessionId"], "sess_old");

    // History replays as updates before the load response.
    agent
        .update(
            "sess_old",
            serde_json::json!({
                "sessionUpdate": "user_message_chunk",
                "content": { "type": "text", "text": "earlier question" }
            }),
        )
        .await;
    agent
        .update(
            "sess_old",
            serde_json::json!({
                "sessionUpdate": "agent_message_chunk",
                "content": { "type": "text", "text": "earlier answer" }
            }),
        )
        .await;
    agent.respond(&load["id"], serde_json::json!({})).await;

    driver.await.unwrap().unwrap();

    let transcript = connection.transcript().await;
    assert_eq!(transcript.len(), 2);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[0].content, "earlier question");
    assert_eq!(transcript[1].role, Role::Assistant);
    assert_eq!(transcript[1].content, "earlier answer");
    assert_eq!(connection.session_id().await.as_deref(), Some("sess_old"));
}
