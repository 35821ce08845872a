//! Inbound request and notification dispatch
//!
//! Routes agent-initiated traffic: `session/update` folds into the
//! transcript, `session/request_permission` goes to the decider, and the
//! `fs/*` and `terminal/*` families delegate to the host services. Responses
//! are written straight back through the transport.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, warn};

use crate::types::{
    FsReadTextFileParams, FsWriteTextFileParams, JsonRpcRequest, JsonRpcResponse,
    PermissionOutcome, RequestPermissionParams, RequestPermissionResult, SessionUpdateNotification,
    TerminalCreateParams, TerminalIdParams, RPC_INTERNAL_ERROR, RPC_INVALID_PARAMS,
    RPC_METHOD_NOT_FOUND,
};

use super::session::Session;
use super::traits::{FileSystem, PermissionDecider, SessionNotification, TerminalManager};
use super::transport::SharedTransport;

/// Dispatches frames the agent initiates.
pub struct MethodRouter {
    transport: SharedTransport,
    session: Arc<Mutex<Session>>,
    fs: Arc<dyn FileSystem>,
    terminals: Arc<dyn TerminalManager>,
    permissions: Arc<dyn PermissionDecider>,
    notification_tx: broadcast::Sender<SessionNotification>,
    working_directory: PathBuf,
    /// Optional upper bound on how long a permission decision may take.
    /// `None` waits forever (the default; a human may be deciding).
    permission_timeout: Option<Duration>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MethodRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: SharedTransport,
        session: Arc<Mutex<Session>>,
        fs: Arc<dyn FileSystem>,
        terminals: Arc<dyn TerminalManager>,
        permissions: Arc<dyn PermissionDecider>,
        notification_tx: broadcast::Sender<SessionNotification>,
        working_directory: PathBuf,
        permission_timeout: Option<Duration>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            session,
            fs,
            terminals,
            permissions,
            notification_tx,
            working_directory,
            permission_timeout,
            shutdown_rx,
        }
    }

    /// Handle a notification (no response owed).
    pub async fn handle_notification(&self, frame: JsonRpcRequest) {
        match frame.method.as_str() {
            "session/update" => {
                let params: SessionUpdateNotification =
                    match serde_json::from_value(frame.params.unwrap_or_default()) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("malformed session/update, dropping: {}", e);
                            return;
                        }
                    };
                self.apply_session_update(params).await;
            }
            other => {
                warn!(method = other, "unhandled notification");
            }
        }
    }

    /// Handle a request (the agent is waiting on our response).
    pub async fn handle_request(&self, frame: JsonRpcRequest) {
        let Some(id) = frame.id.clone() else {
            return;
        };

        match frame.method.as_str() {
            "session/request_permission" => {
                let Some(params) =
                    self.parse_params::<RequestPermissionParams>(&id, frame.params).await
                else {
                    return;
                };
                self.handle_permission_request(id, params).await;
            }
            "fs/read_text_file" => {
                let Some(params) =
                    self.parse_params::<FsReadTextFileParams>(&id, frame.params).await
                else {
                    return;
                };
                self.handle_read_text_file(id, params).await;
            }
            "fs/write_text_file" => {
                let Some(params) =
                    self.parse_params::<FsWriteTextFileParams>(&id, frame.params).await
                else {
                    return;
                };
                self.handle_write_text_file(id, params).await;
            }
            "terminal/create" => {
                let Some(mut params) =
                    self.parse_params::<TerminalCreateParams>(&id, frame.params).await
                else {
                    return;
                };
                if params.cwd.is_none() {
                    params.cwd = Some(self.working_directory.to_string_lossy().to_string());
                }
                match self.terminals.create(params).await {
                    Ok(result) => self.respond_ok(id, &result).await,
                    Err(e) => {
                        self.respond_err(id, RPC_INTERNAL_ERROR, &e.to_string()).await
                    }
                }
            }
            "terminal/output" => {
                let Some(params) =
                    self.parse_params::<TerminalIdParams>(&id, frame.params).await
                else {
                    return;
                };
                match self
                    .terminals
                    .output(&params.session_id, &params.terminal_id)
                    .await
                {
                    Ok(result) => self.respond_ok(id, &result).await,
                    Err(e) => {
                        self.respond_err(id, RPC_INTERNAL_ERROR, &e.to_string()).await
                    }
                }
            }
            "terminal/wait_for_exit" => {
                let Some(params) =
                    self.parse_params::<TerminalIdParams>(&id, frame.params).await
                else {
                    return;
                };
                // The child may never exit on its own; waiting here would
                // stall the read loop and queue the very terminal/kill that
                // could end the wait. Run it on its own task.
                let terminals = self.terminals.clone();
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    let response = match terminals
                        .wait_for_exit(&params.session_id, &params.terminal_id)
                        .await
                    {
                        Ok(status) => JsonRpcResponse::ok(
                            id,
                            serde_json::json!({ "exitStatus": status }),
                        ),
                        Err(e) => JsonRpcResponse::err(id, RPC_INTERNAL_ERROR, &e.to_string()),
                    };
                    if let Ok(frame) = serde_json::to_string(&response) {
                        if transport.send(frame).await.is_err() {
                            debug!("wait_for_exit response after transport closed");
                        }
                    }
                });
            }
            "terminal/kill" => {
                let Some(params) =
                    self.parse_params::<TerminalIdParams>(&id, frame.params).await
                else {
                    return;
                };
                match self
                    .terminals
                    .kill(&params.session_id, &params.terminal_id)
                    .await
                {
                    Ok(()) => self.respond_ok(id, &serde_json::json!({})).await,
                    Err(e) => {
                        self.respond_err(id, RPC_INTERNAL_ERROR, &e.to_string()).await
                    }
                }
            }
            "terminal/release" => {
                let Some(params) =
                    self.parse_params::<TerminalIdParams>(&id, frame.params).await
                else {
                    return;
                };
                match self
                    .terminals
                    .release(&params.session_id, &params.terminal_id)
                    .await
                {
                    Ok(()) => self.respond_ok(id, &serde_json::json!({})).await,
                    Err(e) => {
                        self.respond_err(id, RPC_INTERNAL_ERROR, &e.to_string()).await
                    }
                }
            }
            other => {
                warn!(method = other, "unknown agent request");
                self.respond_err(id, RPC_METHOD_NOT_FOUND, "method not found")
                    .await;
            }
        }
    }

    async fn apply_session_update(&self, notification: SessionUpdateNotification) {
        {
            let mut session = self.session.lock().await;
            session.apply_update(notification.update.clone());
        }
        let _ = self
            .notification_tx
            .send(SessionNotification::Update(notification));
    }

    /// Fold the pending tool call into the transcript immediately, then let
    /// the decision take as long as it takes on its own task. The read loop
    /// stays free, so updates and other requests keep flowing while the
    /// agent waits for an answer.
    async fn handle_permission_request(
        &self,
        id: serde_json::Value,
        params: RequestPermissionParams,
    ) {
        {
            let mut session = self.session.lock().await;
            session.upsert_tool_call(params.tool_call.clone());
        }
        let _ = self.notification_tx.send(SessionNotification::Update(
            SessionUpdateNotification {
                session_id: params.session_id.clone(),
                update: crate::types::SessionUpdate::ToolCall(params.tool_call.clone()),
            },
        ));

        let permissions = self.permissions.clone();
        let transport = self.transport.clone();
        let timeout = self.permission_timeout;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let decision = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, permissions.decide(params))
                        .await
                        .unwrap_or(None),
                    None => permissions.decide(params).await,
                }
            };

            let outcome = tokio::select! {
                choice = decision => match choice {
                    Some(option_id) => PermissionOutcome::Selected { option_id },
                    None => PermissionOutcome::Cancelled,
                },
                _ = shutdown_rx.wait_for(|&stop| stop) => PermissionOutcome::Cancelled,
            };

            let result = RequestPermissionResult { outcome };
            let response = match serde_json::to_value(&result) {
                Ok(value) => JsonRpcResponse::ok(id, value),
                Err(e) => JsonRpcResponse::err(id, RPC_INTERNAL_ERROR, &e.to_string()),
            };
            if let Ok(frame) = serde_json::to_string(&response) {
                if transport.send(frame).await.is_err() {
                    debug!("permission response after transport closed");
                }
            }
        });
    }

    async fn handle_read_text_file(&self, id: serde_json::Value, params: FsReadTextFileParams) {
        match self.fs.read_file(Path::new(&params.path)).await {
            Ok(content) => {
                let content = slice_lines(&content, params.line, params.limit);
                self.respond_ok(id, &serde_json::json!({ "content": content }))
                    .await;
            }
            Err(e) => {
                // Agents probe for files that do not exist yet; a null
                // content result tells them so without failing the turn.
                debug!(path = %params.path, "read_text_file failed: {}", e);
                self.respond_ok(id, &serde_json::json!({ "content": null }))
                    .await;
            }
        }
    }

    async fn handle_write_text_file(&self, id: serde_json::Value, params: FsWriteTextFileParams) {
        if let Err(e) = self
            .fs
            .write_file(Path::new(&params.path), &params.content)
            .await
        {
            warn!(path = %params.path, "write_text_file failed: {}", e);
        }
        self.respond_ok(id, &serde_json::json!({})).await;
    }

    async fn parse_params<T: DeserializeOwned>(
        &self,
        id: &serde_json::Value,
        params: Option<serde_json::Value>,
    ) -> Option<T> {
        match serde_json::from_value(params.unwrap_or_default()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                self.respond_err(id.clone(), RPC_INVALID_PARAMS, &e.to_string())
                    .await;
                None
            }
        }
    }

    async fn respond_ok<T: serde::Serialize>(&self, id: serde_json::Value, result: &T) {
        let value = match serde_json::to_value(result) {
            Ok(value) => value,
            Err(e) => {
                self.respond_err(id, RPC_INTERNAL_ERROR, &e.to_string()).await;
                return;
            }
        };
        self.send_response(JsonRpcResponse::ok(id, value)).await;
    }

    async fn respond_err(&self, id: serde_json::Value, code: i64, message: &str) {
        self.send_response(JsonRpcResponse::err(id, code, message))
            .await;
    }

    async fn send_response(&self, response: JsonRpcResponse) {
        let frame = match serde_json::to_string(&response) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to serialize response: {}", e);
                return;
            }
        };
        if self.transport.send(frame).await.is_err() {
            debug!("response dropped, transport closed");
        }
    }
}

/// Apply the optional 1-indexed `line`/`limit` window to file content. A
/// `limit` without a starting `line` is ignored; slicing only happens when
/// the agent names a first line.
fn slice_lines(content: &str, line: Option<u32>, limit: Option<u32>) -> String {
    let Some(line) = line else {
        return content.to_string();
    };
    let start = (line as usize).saturating_sub(1);
    let take = limit.map(|l| l as usize).unwrap_or(usize::MAX);
    content
        .lines()
        .skip(start)
        .take(take)
        .collect::<Vec<_>>()
        .join("\n")
}
