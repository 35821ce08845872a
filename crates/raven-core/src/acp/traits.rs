//! Host capability seams
//!
//! The agent calls back into the client for file access, terminals, and
//! permission decisions. Each concern is a trait so embedders can supply
//! their own policy; `crate::host` provides local implementations.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    RequestPermissionParams, SessionUpdateNotification, TerminalCreateParams,
    TerminalCreateResult, TerminalExitStatus, TerminalOutputResult,
};

/// Serves `fs/read_text_file` and `fs/write_text_file`.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read_file(&self, path: &Path) -> Result<String>;
    async fn write_file(&self, path: &Path, content: &str) -> Result<()>;
}

/// Serves the `terminal/*` method family.
#[async_trait]
pub trait TerminalManager: Send + Sync {
    async fn create(&self, params: TerminalCreateParams) -> Result<TerminalCreateResult>;
    async fn output(&self, session_id: &str, terminal_id: &str) -> Result<TerminalOutputResult>;
    async fn wait_for_exit(
        &self,
        session_id: &str,
        terminal_id: &str,
    ) -> Result<TerminalExitStatus>;
    async fn kill(&self, session_id: &str, terminal_id: &str) -> Result<()>;
    async fn release(&self, session_id: &str, terminal_id: &str) -> Result<()>;
}

/// Answers `session/request_permission`.
///
/// Returns the chosen option id, or `None` to report the request as
/// cancelled. The decision may take arbitrarily long (a human is usually on
/// the other end); it runs off the connection's read loop so updates keep
/// flowing while the agent waits.
#[async_trait]
pub trait PermissionDecider: Send + Sync {
    async fn decide(&self, request: RequestPermissionParams) -> Option<String>;
}

/// Events surfaced to transcript subscribers.
#[derive(Debug, Clone)]
pub enum SessionNotification {
    /// A `session/update` was applied to the transcript.
    Update(SessionUpdateNotification),
    /// The agent process or transport went away.
    Disconnected,
}
