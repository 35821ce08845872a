//! Raven core: an ACP client engine for driving coding agents
//!
//! Spawns an agent subprocess (or attaches to any [`acp::Transport`]),
//! speaks JSON-RPC over newline-delimited frames, reconstructs the
//! conversation transcript from the agent's update stream, and serves the
//! agent's filesystem, terminal, and permission callbacks through pluggable
//! traits.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! use raven_core::acp::{AcpConnection, ConnectionOptions};
//! use raven_core::host::{LocalFileSystem, LocalTerminalManager};
//! use raven_core::types::ContentBlock;
//!
//! # struct AllowAll;
//! # #[async_trait::async_trait]
//! # impl raven_core::acp::PermissionDecider for AllowAll {
//! #     async fn decide(
//! #         &self,
//! #         request: raven_core::types::RequestPermissionParams,
//! #     ) -> Option<String> {
//! #         request.options.first().map(|o| o.option_id.clone())
//! #     }
//! # }
//! # async fn run() -> raven_core::Result<()> {
//! let connection = AcpConnection::spawn(
//!     "my-agent",
//!     &[],
//!     &HashMap::new(),
//!     ConnectionOptions::new("/path/to/project"),
//!     Arc::new(LocalFileSystem),
//!     Arc::new(LocalTerminalManager::new()),
//!     Arc::new(AllowAll),
//! )?;
//!
//! connection.initialize().await?;
//! connection.session_new().await?;
//! connection
//!     .session_prompt(vec![ContentBlock::text("fix the failing test")])
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod acp;
pub mod error;
pub mod host;
pub mod types;

pub use error::{AcpError, Error, Result};
