//! ACP client engine
//!
//! Drives a coding agent over the Agent Client Protocol: spawn (or attach
//! to) a transport, perform the initialize handshake, run sessions, and
//! fold the agent's update stream into a transcript while serving its
//! filesystem, terminal, and permission callbacks.

mod connection;
mod router;
mod rpc;
mod session;
mod traits;
mod transport;

pub use connection::{AcpConnection, ConnectionOptions, LifecycleState};
pub use rpc::{classify_frame, InboundFrame, RpcCorrelator};
pub use session::{Message, MessagePart, Role, Session, ToolCallPart};
pub use traits::{FileSystem, PermissionDecider, SessionNotification, TerminalManager};
pub use transport::{ChannelTransport, ProcessTransport, SharedTransport, Transport};
