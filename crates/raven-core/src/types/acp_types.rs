//! ACP (Agent Client Protocol) wire type definitions
//!
//! Based on the ACP specification at https://agentclientprotocol.com

use serde::{de, Deserialize, Deserializer, Serialize};

use super::{AvailableCommand, ContentBlock, McpServerConfig, PlanEntry, StopReason};

/// ACP protocol version supported by this client
pub const ACP_PROTOCOL_VERSION: u32 = 1;

/// Client information sent during initialization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub title: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "raven".to_string(),
            title: "Raven".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Client capabilities declared during initialization
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    pub fs: FsCapabilities,
    pub terminal: bool,
}

impl ClientCapabilities {
    /// Everything this engine can actually serve.
    pub fn full() -> Self {
        Self {
            fs: FsCapabilities {
                read_text_file: true,
                write_text_file: true,
            },
            terminal: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FsCapabilities {
    pub read_text_file: bool,
    pub write_text_file: bool,
}

/// Agent capabilities received during initialization, read-only afterwards
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgentCapabilities {
    #[serde(default)]
    pub load_session: bool,
    #[serde(default)]
    pub prompt_capabilities: PromptCapabilities,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromptCapabilities {
    #[serde(default)]
    pub image: bool,
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub embedded_context: bool,
}

/// Agent information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub version: String,
}

/// Authentication method advertised by the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethod {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ============================================================================
// JSON-RPC 2.0 envelope
// ============================================================================

/// JSON-RPC 2.0 request or notification (no `id`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id.into()),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: serde_json::Value, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

pub const RPC_PARSE_ERROR: i64 = -32700;
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;
pub const RPC_INVALID_PARAMS: i64 = -32602;
pub const RPC_INTERNAL_ERROR: i64 = -32603;

// ============================================================================
// Initialize
// ============================================================================

/// `initialize` request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: u32,
    pub client_capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

/// `initialize` response
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: u32,
    #[serde(default)]
    pub agent_info: Option<AgentInfo>,
    #[serde(default)]
    pub auth_methods: Vec<AuthMethod>,
    #[serde(default)]
    pub agent_capabilities: AgentCapabilities,
    #[serde(default)]
    pub modes: Option<ModeState>,
    #[serde(default)]
    pub models: Option<ModelState>,
}

/// Mode block returned by `initialize` / `session/new` / `session/load`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeState {
    pub current_mode_id: String,
    #[serde(default)]
    pub available_modes: Vec<SessionMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMode {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Model block returned by `initialize` / `session/new` / `session/load`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelState {
    pub current_model_id: String,
    #[serde(default)]
    pub available_models: Vec<SessionModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionModel {
    pub model_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ============================================================================
// Session requests
// ============================================================================

/// `session/new` request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewParams {
    pub cwd: String,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

/// `session/new` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNewResult {
    pub session_id: String,
    #[serde(default)]
    pub modes: Option<ModeState>,
    #[serde(default)]
    pub models: Option<ModelState>,
}

/// `session/load` request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLoadParams {
    pub session_id: String,
    pub cwd: String,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

/// `session/load` response (replayed messages arrive as `session/update`
/// notifications, not in this result)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionLoadResult {
    #[serde(default)]
    pub modes: Option<ModeState>,
    #[serde(default)]
    pub models: Option<ModelState>,
}

/// `session/prompt` request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPromptParams {
    pub session_id: String,
    pub prompt: Vec<ContentBlock>,
}

/// `session/prompt` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    pub stop_reason: StopReason,
}

// ============================================================================
// Session updates
// ============================================================================

/// `session/update` notification payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateNotification {
    pub session_id: String,
    pub update: SessionUpdate,
}

impl<'de> Deserialize<'de> for SessionUpdateNotification {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;

        // ACP spec shape:
        // { "sessionId": "...", "update": { "sessionUpdate": "...", ... } }
        if value.get("update").is_some() {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Wrapped {
                session_id: String,
                update: SessionUpdate,
            }

            let wrapped: Wrapped = serde_json::from_value(value).map_err(de::Error::custom)?;
            Ok(Self {
                session_id: wrapped.session_id,
                update: wrapped.update,
            })
        } else {
            // Some implementations flatten the union at the top level:
            // { "sessionId": "...", "sessionUpdate": "...", ... }
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Flat {
                session_id: String,
                #[serde(flatten)]
                update: SessionUpdate,
            }

            let flat: Flat = serde_json::from_value(value).map_err(de::Error::custom)?;
            Ok(Self {
                session_id: flat.session_id,
                update: flat.update,
            })
        }
    }
}

/// Session update union, tagged by `sessionUpdate`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    AgentMessageChunk {
        content: ContentBlock,
    },
    AgentThoughtChunk {
        content: ContentBlock,
    },
    UserMessageChunk {
        content: ContentBlock,
    },
    Plan {
        entries: Vec<PlanEntry>,
    },
    ToolCall(ToolCallPayload),
    ToolCallUpdate(ToolCallPayload),
    AvailableCommandsUpdate {
        #[serde(rename = "availableCommands")]
        available_commands: Vec<AvailableCommand>,
    },
    CurrentModeUpdate {
        #[serde(rename = "currentModeId", alias = "modeId")]
        current_mode_id: String,
    },
    /// Forward compatibility: kinds we do not know are ignored, not errors.
    #[serde(other)]
    Unknown,
}

/// Fields carried by `tool_call` and `tool_call_update` events.
///
/// Everything except the id is optional so the same shape serves both the
/// creation event (all display fields present in practice) and incremental
/// updates (sparse).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallPayload {
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ToolCallKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ToolCallStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallKind {
    Read,
    Edit,
    Delete,
    Move,
    Search,
    Execute,
    Think,
    Fetch,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

// ============================================================================
// Agent-to-client requests
// ============================================================================

/// `session/request_permission` request from the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPermissionParams {
    pub session_id: String,
    pub tool_call: ToolCallPayload,
    pub options: Vec<PermissionOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    pub name: String,
    #[serde(default)]
    pub kind: PermissionOptionKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    #[default]
    AllowOnce,
    AllowAlways,
    RejectOnce,
    RejectAlways,
}

/// `session/request_permission` response payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPermissionResult {
    pub outcome: PermissionOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PermissionOutcome {
    #[serde(rename_all = "camelCase")]
    Selected { option_id: String },
    Cancelled,
}

/// `fs/read_text_file` request from the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsReadTextFileParams {
    pub session_id: String,
    pub path: String,
    /// 1-indexed first line to include
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Number of lines to include from `line`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// `fs/write_text_file` request from the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsWriteTextFileParams {
    pub session_id: String,
    pub path: String,
    pub content: String,
}

/// `terminal/create` request from the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalCreateParams {
    pub session_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<super::EnvVar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_byte_limit: Option<u64>,
}

/// `terminal/create` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalCreateResult {
    pub terminal_id: String,
}

/// Common parameters for `terminal/output|wait_for_exit|kill|release`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalIdParams {
    pub session_id: String,
    pub terminal_id: String,
}

/// `terminal/output` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalOutputResult {
    pub output: String,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<TerminalExitStatus>,
}

/// Exit status of a terminal command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TerminalExitStatus {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_update_wrapped_shape() {
        let value = serde_json::json!({
            "sessionId": "s1",
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": { "type": "text", "text": "Hello" }
            }
        });

        let parsed: SessionUpdateNotification = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.session_id, "s1");
        assert!(matches!(
            parsed.update,
            SessionUpdate::AgentMessageChunk { .. }
        ));
    }

    #[test]
    fn session_update_flat_shape() {
        let value = serde_json::json!({
            "sessionId": "s1",
            "sessionUpdate": "agent_message_chunk",
            "content": { "type": "text", "text": "Hello" }
        });

        let parsed: SessionUpdateNotification = serde_json::from_value(value).unwrap();
        assert!(matches!(
            parsed.update,
            SessionUpdate::AgentMessageChunk { .. }
        ));
    }

    #[test]
    fn unknown_update_kind_is_not_an_error() {
        let value = serde_json::json!({
            "sessionId": "s1",
            "update": { "sessionUpdate": "something_new", "payload": 1 }
        });

        let parsed: SessionUpdateNotification = serde_json::from_value(value).unwrap();
        assert!(matches!(parsed.update, SessionUpdate::Unknown));
    }

    #[test]
    fn tool_call_payload_sparse_fields() {
        let value = serde_json::json!({
            "sessionId": "s1",
            "update": {
                "sessionUpdate": "tool_call_update",
                "toolCallId": "tc1",
                "status": "completed"
            }
        });

        let parsed: SessionUpdateNotification = serde_json::from_value(value).unwrap();
        match parsed.update {
            SessionUpdate::ToolCallUpdate(payload) => {
                assert_eq!(payload.tool_call_id, "tc1");
                assert_eq!(payload.status, Some(ToolCallStatus::Completed));
                assert!(payload.title.is_none());
                assert!(payload.kind.is_none());
            }
            other => panic!("unexpected update: {:?}", other),
        }
    }

    #[test]
    fn permission_outcome_wire_shape() {
        let selected = RequestPermissionResult {
            outcome: PermissionOutcome::Selected {
                option_id: "allow".to_string(),
            },
        };
        let json = serde_json::to_value(&selected).unwrap();
        assert_eq!(json["outcome"]["outcome"], "selected");
        assert_eq!(json["outcome"]["optionId"], "allow");

        let cancelled = RequestPermissionResult {
            outcome: PermissionOutcome::Cancelled,
        };
        let json = serde_json::to_value(&cancelled).unwrap();
        assert_eq!(json["outcome"]["outcome"], "cancelled");
    }

    #[test]
    fn stop_reason_wire_names() {
        let r: StopReason = serde_json::from_value(serde_json::json!("end_turn")).unwrap();
        assert_eq!(r, StopReason::EndTurn);
        let r: StopReason = serde_json::from_value(serde_json::json!("max_turn_requests")).unwrap();
        assert_eq!(r, StopReason::MaxTurnRequests);
    }

    #[test]
    fn initialize_result_defaults() {
        let value = serde_json::json!({ "protocolVersion": 1 });
        let parsed: InitializeResult = serde_json::from_value(value).unwrap();
        assert!(!parsed.agent_capabilities.load_session);
        assert!(!parsed.agent_capabilities.prompt_capabilities.image);
        assert!(parsed.auth_methods.is_empty());
    }
}
