//! Error types for Raven Core

use thiserror::Error;

/// Main error type for Raven operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("ACP protocol error: {0}")]
    Acp(#[from] AcpError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// ACP-specific errors
#[derive(Error, Debug)]
pub enum AcpError {
    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection disposed")]
    Disposed,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Agent error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Capability not supported: {0}")]
    CapabilityNotSupported(String),

    #[error("No session bound to this connection")]
    NoSession,

    #[error("Connection is not ready: {0}")]
    NotReady(String),

    #[error("Terminal not found: {0}")]
    TerminalNotFound(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
