//! ACP connection lifecycle
//!
//! `AcpConnection` owns one agent transport end to end: the read loop that
//! classifies frames, the RPC correlator for outbound calls, the session
//! state, and the inbound router. Lifecycle runs strictly forward:
//! uninitialized -> initializing -> ready -> disposed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{AcpError, Result};
use crate::types::{
    AgentInfo, AuthMethod, AvailableCommand, ClientCapabilities, ClientInfo, ContentBlock,
    InitializeParams, InitializeResult, McpServerConfig, ModeState, ModelState,
    PromptCapabilities, PromptResponse, SessionLoadParams, SessionLoadResult, SessionNewParams,
    SessionNewResult, SessionPromptParams, StopReason, ACP_PROTOCOL_VERSION,
};

use super::router::MethodRouter;
use super::rpc::{classify_frame, InboundFrame, RpcCorrelator};
use super::session::{Message, Session};
use super::traits::{FileSystem, PermissionDecider, SessionNotification, TerminalManager};
use super::transport::{ProcessTransport, SharedTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    Disposed,
}

/// Knobs for a connection beyond the transport itself.
pub struct ConnectionOptions {
    pub working_directory: PathBuf,
    /// Cap on how long a permission decision may take; `None` waits forever.
    pub permission_timeout: Option<Duration>,
}

impl ConnectionOptions {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            permission_timeout: None,
        }
    }
}

/// One live connection to an agent.
pub struct AcpConnection {
    transport: SharedTransport,
    rpc: Arc<RpcCorrelator>,
    session: Arc<Mutex<Session>>,
    state: Mutex<LifecycleState>,
    init: RwLock<Option<InitializeResult>>,
    /// Serializes `session/prompt` turns; ACP allows one in flight.
    prompt_gate: Mutex<()>,
    notification_tx: broadcast::Sender<SessionNotification>,
    shutdown_tx: watch::Sender<bool>,
}

impl AcpConnection {
    /// Build a connection over an existing transport and start its read
    /// loop. Call `initialize` before anything else.
    pub fn new(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
        fs: Arc<dyn FileSystem>,
        terminals: Arc<dyn TerminalManager>,
        permissions: Arc<dyn PermissionDecider>,
    ) -> Arc<Self> {
        let session = Arc::new(Mutex::new(Session::new(
            options.working_directory.clone(),
        )));
        let rpc = RpcCorrelator::new(transport.clone());
        let (notification_tx, _) = broadcast::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let router = MethodRouter::new(
            transport.clone(),
            session.clone(),
            fs,
            terminals,
            permissions,
            notification_tx.clone(),
            options.working_directory,
            options.permission_timeout,
            shutdown_rx,
        );

        let connection = Arc::new(Self {
            transport: transport.clone(),
            rpc: rpc.clone(),
            session,
            state: Mutex::new(LifecycleState::Uninitialized),
            init: RwLock::new(None),
            prompt_gate: Mutex::new(()),
            notification_tx: notification_tx.clone(),
            shutdown_tx: shutdown_tx.clone(),
        });

        tokio::spawn(read_loop(
            transport,
            rpc,
            router,
            notification_tx,
            shutdown_tx,
        ));

        connection
    }

    /// Spawn an agent subprocess and connect over its stdio.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        options: ConnectionOptions,
        fs: Arc<dyn FileSystem>,
        terminals: Arc<dyn TerminalManager>,
        permissions: Arc<dyn PermissionDecider>,
    ) -> Result<Arc<Self>> {
        let transport = ProcessTransport::spawn(
            command,
            args,
            env,
            Some(options.working_directory.as_path()),
        )?;
        info!(command, "spawned agent process");
        Ok(Self::new(
            Arc::new(transport),
            options,
            fs,
            terminals,
            permissions,
        ))
    }

    /// Perform the `initialize` handshake. Must run exactly once, before any
    /// session call.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        {
            let mut state = self.state.lock().await;
            match *state {
                LifecycleState::Uninitialized => *state = LifecycleState::Initializing,
                LifecycleState::Disposed => return Err(AcpError::Disposed.into()),
                other => {
                    return Err(AcpError::NotReady(format!(
                        "initialize called in state {:?}",
                        other
                    ))
                    .into())
                }
            }
        }

        let params = InitializeParams {
            protocol_version: ACP_PROTOCOL_VERSION,
            client_capabilities: ClientCapabilities::full(),
            client_info: ClientInfo::default(),
        };

        let result = self
            .rpc
            .call("initialize", Some(serde_json::to_value(&params)?))
            .await;

        let result = match result {
            Ok(value) => value,
            Err(e) => {
                *self.state.lock().await = LifecycleState::Uninitialized;
                return Err(e);
            }
        };

        let init: InitializeResult = serde_json::from_value(result)?;
        if let Some(info) = &init.agent_info {
            info!(agent = %info.name, version = %info.version, "agent initialized");
        }

        {
            let mut session = self.session.lock().await;
            apply_mode_state(&mut session, init.modes.clone());
            apply_model_state(&mut session, init.models.clone());
        }

        *self.init.write().await = Some(init.clone());
        *self.state.lock().await = LifecycleState::Ready;
        Ok(init)
    }

    /// Create a fresh session. A no-op returning the existing id when one is
    /// already bound.
    pub async fn session_new(&self) -> Result<String> {
        self.ensure_ready().await?;

        if let Some(id) = self.session.lock().await.session_id.clone() {
            debug!(session_id = %id, "session already bound");
            return Ok(id);
        }

        let cwd = self
            .session
            .lock()
            .await
            .working_directory
            .to_string_lossy()
            .to_string();
        let params = SessionNewParams {
            cwd,
            mcp_servers: Vec::<McpServerConfig>::new(),
        };
        let value = self
            .rpc
            .call("session/new", Some(serde_json::to_value(&params)?))
            .await?;
        let result: SessionNewResult = serde_json::from_value(value)?;

        let mut session = self.session.lock().await;
        session.session_id = Some(result.session_id.clone());
        apply_mode_state(&mut session, result.modes);
        apply_model_state(&mut session, result.models);
        info!(session_id = %result.session_id, "session created");
        Ok(result.session_id)
    }

    /// Resume a previous session by id. The agent replays its history as
    /// `session/update` notifications before this returns.
    pub async fn session_load(&self, session_id: &str) -> Result<()> {
        self.ensure_ready().await?;

        let supported = self
            .init
            .read()
            .await
            .as_ref()
            .map(|init| init.agent_capabilities.load_session)
            .unwrap_or(false);
        if !supported {
            return Err(AcpError::CapabilityNotSupported("loadSession".to_string()).into());
        }

        let cwd = {
            let mut session = self.session.lock().await;
            session.reset();
            session.working_directory.to_string_lossy().to_string()
        };

        let params = SessionLoadParams {
            session_id: session_id.to_string(),
            cwd,
            mcp_servers: Vec::new(),
        };
        let value = self
            .rpc
            .call("session/load", Some(serde_json::to_value(&params)?))
            .await?;
        let result: SessionLoadResult = serde_json::from_value(value)?;

        let mut session = self.session.lock().await;
        session.session_id = Some(session_id.to_string());
        apply_mode_state(&mut session, result.modes);
        apply_model_state(&mut session, result.models);
        info!(session_id, "session loaded");
        Ok(())
    }

    /// Send one prompt turn and wait for the agent to finish it. Updates
    /// stream into the transcript while this is pending; concurrent callers
    /// queue behind the gate.
    pub async fn session_prompt(&self, prompt: Vec<ContentBlock>) -> Result<StopReason> {
        self.ensure_ready().await?;
        self.check_prompt_capabilities(&prompt).await?;

        let session_id = self.require_session_id().await?;
        let _turn = self.prompt_gate.lock().await;

        let params = SessionPromptParams { session_id, prompt };
        let value = self
            .rpc
            .call("session/prompt", Some(serde_json::to_value(&params)?))
            .await?;
        let response: PromptResponse = serde_json::from_value(value)?;
        debug!(stop_reason = ?response.stop_reason, "prompt turn finished");
        Ok(response.stop_reason)
    }

    /// Ask the agent to stop the current turn. Fire-and-forget; the pending
    /// prompt still resolves, with a `cancelled` stop reason.
    pub async fn session_cancel(&self) -> Result<()> {
        self.ensure_ready().await?;
        let session_id = self.require_session_id().await?;
        self.rpc
            .notify(
                "session/cancel",
                Some(serde_json::json!({ "sessionId": session_id })),
            )
            .await
    }

    pub async fn set_mode(&self, mode_id: &str) -> Result<()> {
        self.ensure_ready().await?;
        let session_id = self.require_session_id().await?;
        self.rpc
            .call(
                "session/set_mode",
                Some(serde_json::json!({ "sessionId": session_id, "modeId": mode_id })),
            )
            .await?;
        self.session.lock().await.current_mode_id = Some(mode_id.to_string());
        Ok(())
    }

    pub async fn set_model(&self, model_id: &str) -> Result<()> {
        self.ensure_ready().await?;
        let session_id = self.require_session_id().await?;
        self.rpc
            .call(
                "session/set_model",
                Some(serde_json::json!({ "sessionId": session_id, "modelId": model_id })),
            )
            .await?;
        self.session.lock().await.current_model_id = Some(model_id.to_string());
        Ok(())
    }

    /// Tear the connection down: fail pending calls, stop the agent, wake
    /// permission waits. Safe to call more than once.
    pub async fn dispose(&self) {
        {
            let mut state = self.state.lock().await;
            if *state == LifecycleState::Disposed {
                return;
            }
            *state = LifecycleState::Disposed;
        }
        let _ = self.shutdown_tx.send(true);
        self.rpc.reject_all().await;
        self.transport.close().await;
        info!("connection disposed");
    }

    /// Subscribe to transcript updates and disconnect events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.notification_tx.subscribe()
    }

    /// Snapshot of the transcript messages.
    pub async fn transcript(&self) -> Vec<Message> {
        self.session.lock().await.messages.clone()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session.lock().await.session_id.clone()
    }

    pub async fn current_mode_id(&self) -> Option<String> {
        self.session.lock().await.current_mode_id.clone()
    }

    pub async fn current_model_id(&self) -> Option<String> {
        self.session.lock().await.current_model_id.clone()
    }

    pub async fn available_commands(&self) -> Vec<AvailableCommand> {
        self.session.lock().await.available_commands.clone()
    }

    pub async fn agent_info(&self) -> Option<AgentInfo> {
        self.init.read().await.as_ref().and_then(|i| i.agent_info.clone())
    }

    pub async fn auth_methods(&self) -> Vec<AuthMethod> {
        self.init
            .read()
            .await
            .as_ref()
            .map(|i| i.auth_methods.clone())
            .unwrap_or_default()
    }

    pub async fn prompt_capabilities(&self) -> PromptCapabilities {
        self.init
            .read()
            .await
            .as_ref()
            .map(|i| i.agent_capabilities.prompt_capabilities)
            .unwrap_or_default()
    }

    pub async fn supports_load_session(&self) -> bool {
        self.init
            .read()
            .await
            .as_ref()
            .map(|i| i.agent_capabilities.load_session)
            .unwrap_or(false)
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.lock().await
    }

    async fn ensure_ready(&self) -> Result<()> {
        match *self.state.lock().await {
            LifecycleState::Ready => Ok(()),
            LifecycleState::Disposed => Err(AcpError::Disposed.into()),
            other => Err(AcpError::NotReady(format!("{:?}", other)).into()),
        }
    }

    async fn require_session_id(&self) -> Result<String> {
        self.session
            .lock()
            .await
            .session_id
            .clone()
            .ok_or_else(|| AcpError::NoSession.into())
    }

    /// Reject prompt blocks the agent never claimed to understand rather
    /// than letting it fail the turn.
    async fn check_prompt_capabilities(&self, prompt: &[ContentBlock]) -> Result<()> {
        let caps = self.prompt_capabilities().await;
        for block in prompt {
            let missing = match block {
                ContentBlock::Image { .. } if !caps.image => Some("image"),
                ContentBlock::Audio { .. } if !caps.audio => Some("audio"),
                ContentBlock::Resource { .. } if !caps.embedded_context => {
                    Some("embeddedContext")
                }
                _ => None,
            };
            if let Some(name) = missing {
                return Err(AcpError::CapabilityNotSupported(name.to_string()).into());
            }
        }
        Ok(())
    }
}

fn apply_mode_state(session: &mut Session, modes: Option<ModeState>) {
    if let Some(modes) = modes {
        session.current_mode_id = Some(modes.current_mode_id);
        session.available_modes = modes.available_modes;
    }
}

fn apply_model_state(session: &mut Session, models: Option<ModelState>) {
    if let Some(models) = models {
        session.current_model_id = Some(models.current_model_id);
        session.available_models = models.available_models;
    }
}

/// Single consumer of the transport: classifies each frame and hands it to
/// the correlator or the router. Ends when the transport does, rejecting
/// everything still pending.
async fn read_loop(
    transport: SharedTransport,
    rpc: Arc<RpcCorrelator>,
    router: MethodRouter,
    notification_tx: broadcast::Sender<SessionNotification>,
    shutdown_tx: watch::Sender<bool>,
) {
    while let Some(frame) = transport.recv().await {
        let value: serde_json::Value = match serde_json::from_str(&frame) {
            Ok(value) => value,
            Err(_) => {
                // Agents sometimes print banners or stray diagnostics on
                // stdout before speaking JSON.
                debug!(frame = %frame, "skipping non-JSON line");
                continue;
            }
        };

        match classify_frame(value) {
            Ok(InboundFrame::Response(response)) => rpc.handle_response(response).await,
            Ok(InboundFrame::Request(request)) => router.handle_request(request).await,
            Ok(InboundFrame::Notification(notification)) => {
                router.handle_notification(notification).await
            }
            Err(e) => warn!("unclassifiable frame: {}", e),
        }
    }

    debug!("agent transport closed, shutting down");
    let _ = shutdown_tx.send(true);
    rpc.reject_all().await;
    let _ = notification_tx.send(SessionNotification::Disconnected);
}
