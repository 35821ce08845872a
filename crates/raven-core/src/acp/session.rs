//! Session state and the transcript reducer
//!
//! A `Session` folds the stream of `session/update` notifications into an
//! ordered transcript. Chunk events append to the last message part of the
//! same kind, plans and user chunks start fresh messages, and tool calls are
//! upserted in place by id so progress updates never reorder the transcript.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;
use tracing::debug;

use crate::types::{
    AvailableCommand, ContentBlock, PlanEntry, SessionModel, SessionMode, SessionUpdate,
    ToolCallKind, ToolCallPayload, ToolCallStatus,
};

/// Who authored a transcript message
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One structured piece of a message
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Thought { thought: String },
    Plan { plan: Vec<PlanEntry> },
    ToolCall(ToolCallPart),
    /// Non-text content block carried through unchanged (images, resources).
    Block { block: ContentBlock },
}

/// Live view of one tool call, merged across its update events
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallPart {
    pub tool_call_id: String,
    pub title: Option<String>,
    pub kind: ToolCallKind,
    pub status: ToolCallStatus,
    pub content: Vec<serde_json::Value>,
    pub locations: Vec<serde_json::Value>,
    pub raw_input: Option<serde_json::Value>,
    pub raw_output: Option<serde_json::Value>,
}

impl ToolCallPart {
    fn from_payload(payload: ToolCallPayload) -> Self {
        Self {
            tool_call_id: payload.tool_call_id,
            title: payload.title,
            kind: payload.kind.unwrap_or_default(),
            status: payload.status.unwrap_or_default(),
            content: payload.content.unwrap_or_default(),
            locations: payload.locations.unwrap_or_default(),
            raw_input: payload.raw_input,
            raw_output: payload.raw_output,
        }
    }

    /// Overlay the fields an update actually carries; absent fields keep
    /// their current value.
    fn merge(&mut self, payload: ToolCallPayload) {
        if let Some(title) = payload.title {
            self.title = Some(title);
        }
        if let Some(kind) = payload.kind {
            self.kind = kind;
        }
        if let Some(status) = payload.status {
            self.status = status;
        }
        if let Some(content) = payload.content {
            self.content = content;
        }
        if let Some(locations) = payload.locations {
            self.locations = locations;
        }
        if let Some(raw_input) = payload.raw_input {
            self.raw_input = Some(raw_input);
        }
        if let Some(raw_output) = payload.raw_output {
            self.raw_output = Some(raw_output);
        }
    }
}

/// One transcript message
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// Flat text preview accumulated alongside the structured parts.
    pub content: String,
    pub parts: Vec<MessagePart>,
}

impl Message {
    fn new(id: String, role: Role) -> Self {
        Self {
            id,
            role,
            content: String::new(),
            parts: Vec::new(),
        }
    }
}

/// State of one agent session: transcript plus session-level metadata.
#[derive(Debug, Default)]
pub struct Session {
    pub session_id: Option<String>,
    pub working_directory: PathBuf,
    pub current_mode_id: Option<String>,
    pub available_modes: Vec<SessionMode>,
    pub current_model_id: Option<String>,
    pub available_models: Vec<SessionModel>,
    pub available_commands: Vec<AvailableCommand>,
    pub messages: Vec<Message>,
    /// toolCallId -> index into `messages`
    tool_calls: HashMap<String, usize>,
}

impl Session {
    pub fn new(working_directory: PathBuf) -> Self {
        Self {
            working_directory,
            ..Default::default()
        }
    }

    /// Apply one update to the transcript. Single entry point; callers hold
    /// the session lock across the whole call so updates apply in arrival
    /// order.
    pub fn apply_update(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::AgentMessageChunk { content } => {
                self.append_chunk(Role::Assistant, content, false);
            }
            SessionUpdate::AgentThoughtChunk { content } => {
                self.append_chunk(Role::Assistant, content, true);
            }
            SessionUpdate::UserMessageChunk { content } => {
                // User chunks each start a fresh message; the agent replays
                // them on session/load one message at a time.
                let mut message = self.new_message(Role::User);
                push_content(&mut message, content, false);
                self.messages.push(message);
            }
            SessionUpdate::Plan { entries } => {
                let mut message = self.new_message(Role::Assistant);
                message.content =
                    serde_json::to_string(&entries).unwrap_or_default();
                message.parts.push(MessagePart::Plan { plan: entries });
                self.messages.push(message);
            }
            SessionUpdate::ToolCall(payload) => self.upsert_tool_call(payload),
            SessionUpdate::ToolCallUpdate(payload) => self.update_tool_call(payload),
            SessionUpdate::AvailableCommandsUpdate { available_commands } => {
                self.available_commands = available_commands;
            }
            SessionUpdate::CurrentModeUpdate { current_mode_id } => {
                self.current_mode_id = Some(current_mode_id);
            }
            SessionUpdate::Unknown => {
                debug!("ignoring unknown session update kind");
            }
        }
    }

    /// Record a tool call, creating it or merging into the existing entry.
    ///
    /// Creation is idempotent by id: agents may emit `tool_call` again for a
    /// call they already announced (and a permission request folds the same
    /// payload in before the update stream does).
    pub fn upsert_tool_call(&mut self, payload: ToolCallPayload) {
        if let Some(&index) = self.tool_calls.get(&payload.tool_call_id) {
            self.merge_tool_call_at(index, payload);
            return;
        }

        let mut message = self.new_message(Role::Assistant);
        message.content = payload.title.clone().unwrap_or_default();
        let id = payload.tool_call_id.clone();
        message.parts.push(MessagePart::ToolCall(ToolCallPart::from_payload(payload)));
        self.messages.push(message);
        self.tool_calls.insert(id, self.messages.len() - 1);
    }

    /// `tool_call_update` for a call we never saw is dropped, not invented:
    /// a synthetic entry would have no title or kind to show.
    fn update_tool_call(&mut self, payload: ToolCallPayload) {
        match self.tool_calls.get(&payload.tool_call_id) {
            Some(&index) => self.merge_tool_call_at(index, payload),
            None => {
                debug!(
                    tool_call_id = %payload.tool_call_id,
                    "dropping update for unknown tool call"
                );
            }
        }
    }

    fn merge_tool_call_at(&mut self, index: usize, payload: ToolCallPayload) {
        let Some(message) = self.messages.get_mut(index) else {
            return;
        };
        let new_title = payload.title.clone();
        for part in &mut message.parts {
            if let MessagePart::ToolCall(part) = part {
                if part.tool_call_id == payload.tool_call_id {
                    part.merge(payload);
                    break;
                }
            }
        }
        if let Some(title) = new_title {
            message.content = title;
        }
    }

    /// Chunk events extend the last message when it has the right role,
    /// otherwise they open a new one.
    fn append_chunk(&mut self, role: Role, content: ContentBlock, thought: bool) {
        let extend = self
            .messages
            .last()
            .map(|m| m.role == role)
            .unwrap_or(false);

        if extend {
            if let Some(message) = self.messages.last_mut() {
                push_content(message, content, thought);
            }
        } else {
            let mut message = self.new_message(role);
            push_content(&mut message, content, thought);
            self.messages.push(message);
        }
    }

    fn new_message(&self, role: Role) -> Message {
        // Ordinal ids: stable within a session, cheap to assign.
        Message::new(format!("msg_{}", self.messages.len()), role)
    }

    pub fn tool_call_count(&self) -> usize {
        self.tool_calls.len()
    }

    /// Forget transcript and per-session metadata, keep the working
    /// directory. Used when rebinding a connection to a fresh session.
    pub fn reset(&mut self) {
        self.session_id = None;
        self.current_mode_id = None;
        self.available_modes.clear();
        self.current_model_id = None;
        self.available_models.clear();
        self.available_commands.clear();
        self.messages.clear();
        self.tool_calls.clear();
    }
}

/// Append a content block to a message, coalescing consecutive text of the
/// same kind into one part.
fn push_content(message: &mut Message, content: ContentBlock, thought: bool) {
    match content {
        ContentBlock::Text { text } => {
            message.content.push_str(&text);
            match (message.parts.last_mut(), thought) {
                (Some(MessagePart::Text { text: existing }), false) => {
                    existing.push_str(&text);
                }
                (Some(MessagePart::Thought { thought: existing }), true) => {
                    existing.push_str(&text);
                }
                _ if thought => message.parts.push(MessagePart::Thought { thought: text }),
                _ => message.parts.push(MessagePart::Text { text }),
            }
        }
        other => {
            message.parts.push(MessagePart::Block { block: other });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn text_chunk(text: &str) -> SessionUpdate {
        SessionUpdate::AgentMessageChunk {
            content: ContentBlock::text(text),
        }
    }

    fn tool_call(id: &str, title: Option<&str>, status: Option<ToolCallStatus>) -> ToolCallPayload {
        ToolCallPayload {
            tool_call_id: id.to_string(),
            title: title.map(str::to_string),
            status,
            ..Default::default()
        }
    }

    #[test]
    fn consecutive_chunks_merge_into_one_message() {
        let mut session = Session::default();
        session.apply_update(text_chunk("Hello"));
        session.apply_update(text_chunk(" there"));

        assert_eq!(session.messages.len(), 1);
        let message = &session.messages[0];
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.content, "Hello there");
        assert_eq!(
            message.parts,
            vec![MessagePart::Text {
                text: "Hello there".to_string()
            }]
        );
    }

    #[test]
    fn thought_and_text_chunks_stay_separate_parts() {
        let mut session = Session::default();
        session.apply_update(SessionUpdate::AgentThoughtChunk {
            content: ContentBlock::text("hmm"),
        });
        session.apply_update(text_chunk("answer"));
        session.apply_update(SessionUpdate::AgentThoughtChunk {
            content: ContentBlock::text(" more"),
        });

        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].parts.len(), 3);
        assert_eq!(session.messages[0].content, "hmmanswer more");
    }

    #[test]
    fn user_chunk_always_starts_new_message() {
        let mut session = Session::default();
        session.apply_update(SessionUpdate::UserMessageChunk {
            content: ContentBlock::text("first"),
        });
        session.apply_update(SessionUpdate::UserMessageChunk {
            content: ContentBlock::text("second"),
        });

        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[0].content, "first");
        assert_eq!(session.messages[1].content, "second");
    }

    #[test]
    fn user_chunk_breaks_assistant_run() {
        let mut session = Session::default();
        session.apply_update(text_chunk("a"));
        session.apply_update(SessionUpdate::UserMessageChunk {
            content: ContentBlock::text("q"),
        });
        session.apply_update(text_chunk("b"));

        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.messages[2].content, "b");
    }

    #[test]
    fn plan_always_starts_new_message() {
        let mut session = Session::default();
        session.apply_update(text_chunk("working"));
        session.apply_update(SessionUpdate::Plan {
            entries: vec![PlanEntry {
                content: "step one".to_string(),
                priority: None,
                status: crate::types::PlanStatus::Pending,
            }],
        });
        session.apply_update(SessionUpdate::Plan { entries: vec![] });

        assert_eq!(session.messages.len(), 3);
        assert!(matches!(
            session.messages[1].parts[0],
            MessagePart::Plan { .. }
        ));
    }

    #[test]
    fn tool_call_then_update_merges_in_place() {
        let mut session = Session::default();
        session.apply_update(text_chunk("before"));
        session.apply_update(SessionUpdate::ToolCall(tool_call(
            "tc1",
            Some("Reading file"),
            Some(ToolCallStatus::Pending),
        )));
        session.apply_update(text_chunk("after"));
        session.apply_update(SessionUpdate::ToolCallUpdate(tool_call(
            "tc1",
            None,
            Some(ToolCallStatus::Completed),
        )));

        // The chunk after the tool call extends the same assistant message
        // rather than opening a new one.
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].content, "before");
        match &session.messages[1].parts[0] {
            MessagePart::ToolCall(part) => {
                assert_eq!(part.status, ToolCallStatus::Completed);
                assert_eq!(part.title.as_deref(), Some("Reading file"));
            }
            other => panic!("unexpected part: {:?}", other),
        }
        assert_eq!(
            session.messages[1].parts[1],
            MessagePart::Text {
                text: "after".to_string()
            }
        );
    }

    #[test]
    fn duplicate_tool_call_is_merged_not_duplicated() {
        let mut session = Session::default();
        session.apply_update(SessionUpdate::ToolCall(tool_call(
            "tc1",
            Some("first"),
            Some(ToolCallStatus::Pending),
        )));
        session.apply_update(SessionUpdate::ToolCall(tool_call(
            "tc1",
            Some("second"),
            Some(ToolCallStatus::InProgress),
        )));

        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.tool_call_count(), 1);
        assert_eq!(session.messages[0].content, "second");
    }

    #[test]
    fn update_for_unknown_tool_call_is_dropped() {
        let mut session = Session::default();
        session.apply_update(SessionUpdate::ToolCallUpdate(tool_call(
            "ghost",
            Some("never announced"),
            Some(ToolCallStatus::Completed),
        )));

        assert!(session.messages.is_empty());
        assert_eq!(session.tool_call_count(), 0);
    }

    #[test]
    fn tool_call_update_refreshes_title_preview() {
        let mut session = Session::default();
        session.apply_update(SessionUpdate::ToolCall(tool_call(
            "tc1",
            Some("Running tests"),
            Some(ToolCallStatus::InProgress),
        )));
        session.apply_update(SessionUpdate::ToolCallUpdate(tool_call(
            "tc1",
            Some("Tests passed"),
            Some(ToolCallStatus::Completed),
        )));

        assert_eq!(session.messages[0].content, "Tests passed");
    }

    #[test]
    fn metadata_updates_do_not_touch_transcript() {
        let mut session = Session::default();
        session.apply_update(text_chunk("hello"));
        session.apply_update(SessionUpdate::CurrentModeUpdate {
            current_mode_id: "plan".to_string(),
        });
        session.apply_update(SessionUpdate::AvailableCommandsUpdate {
            available_commands: vec![AvailableCommand {
                name: "review".to_string(),
                description: "Review code".to_string(),
                input: None,
            }],
        });
        session.apply_update(SessionUpdate::Unknown);

        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.current_mode_id.as_deref(), Some("plan"));
        assert_eq!(session.available_commands.len(), 1);
    }

    #[test]
    fn non_text_chunk_becomes_block_part() {
        let mut session = Session::default();
        session.apply_update(SessionUpdate::AgentMessageChunk {
            content: ContentBlock::Image {
                data: "aGk=".to_string(),
                mime_type: "image/png".to_string(),
                uri: None,
            },
        });

        assert_eq!(session.messages.len(), 1);
        assert!(matches!(
            session.messages[0].parts[0],
            MessagePart::Block { .. }
        ));
        assert_eq!(session.messages[0].content, "");
    }

    #[test]
    fn reset_clears_transcript_and_metadata() {
        let mut session = Session::new(PathBuf::from("/tmp"));
        session.session_id = Some("s1".to_string());
        session.apply_update(text_chunk("hello"));
        session.apply_update(SessionUpdate::ToolCall(tool_call("tc1", None, None)));

        session.reset();

        assert!(session.session_id.is_none());
        assert!(session.messages.is_empty());
        assert_eq!(session.tool_call_count(), 0);
        assert_eq!(session.working_directory, PathBuf::from("/tmp"));
    }
}
