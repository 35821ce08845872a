//! Frame transports for ACP connections
//!
//! A transport moves newline-delimited JSON frames in both directions without
//! interpreting them. `ProcessTransport` wraps a spawned agent subprocess;
//! `ChannelTransport` is an in-memory duplex used by tests and embedders.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{AcpError, Result};

/// Bidirectional stream of protocol frames (one JSON message per frame).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame to the peer.
    async fn send(&self, frame: String) -> Result<()>;

    /// Receive the next frame, or `None` once the peer is gone.
    async fn recv(&self) -> Option<String>;

    /// Tear down the transport. Subsequent `recv` calls return `None`.
    async fn close(&self);
}

/// Transport over the stdio of a spawned agent subprocess.
///
/// Three tasks run per process: a writer draining the outbound queue into
/// stdin, a reader splitting stdout into lines, and a drain that logs stderr.
pub struct ProcessTransport {
    outbound_tx: mpsc::Sender<String>,
    inbound_rx: Mutex<mpsc::Receiver<String>>,
    child: Mutex<Option<Child>>,
}

impl ProcessTransport {
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AcpError::SpawnFailed(format!("{}: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AcpError::SpawnFailed("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AcpError::SpawnFailed("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AcpError::SpawnFailed("failed to capture stderr".to_string()))?;

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(100);
        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(100);

        // Writer: outbound queue -> child stdin, one frame per line.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(frame) = outbound_rx.recv().await {
                if stdin.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
            debug!("agent stdin writer stopped");
        });

        // Reader: child stdout -> inbound queue. Channel closure on EOF is
        // the disconnect signal.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if inbound_tx.send(line).await.is_err() {
                    break;
                }
            }
            debug!("agent stdout reader stopped");
        });

        // Agents log freely on stderr; keep it flowing so the pipe never
        // fills, and surface it at warn level.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    warn!(target: "raven_core::agent_stderr", "{}", line);
                }
            }
        });

        Ok(Self {
            outbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            child: Mutex::new(Some(child)),
        })
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn send(&self, frame: String) -> Result<()> {
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| AcpError::ConnectionClosed)?;
        Ok(())
    }

    async fn recv(&self) -> Option<String> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!("failed to kill agent process: {}", e);
            }
        }
        self.inbound_rx.lock().await.close();
    }
}

/// In-memory duplex transport.
///
/// `pair()` returns two connected halves; frames sent on one side arrive on
/// the other. Used to exercise the full connection stack against a scripted
/// peer.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::Sender<String>>>,
    rx: Mutex<mpsc::Receiver<String>>,
}

impl ChannelTransport {
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(buffer);
        let (b_tx, b_rx) = mpsc::channel(buffer);
        (
            Self {
                tx: Mutex::new(Some(a_tx)),
                rx: Mutex::new(b_rx),
            },
            Self {
                tx: Mutex::new(Some(b_tx)),
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: String) -> Result<()> {
        let guard = self.tx.lock().await;
        let tx = guard.as_ref().ok_or(AcpError::ConnectionClosed)?;
        tx.send(frame).await.map_err(|_| AcpError::ConnectionClosed)?;
        Ok(())
    }

    async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        // Dropping the sender makes the peer's recv() return None.
        self.tx.lock().await.take();
        self.rx.lock().await.close();
    }
}

/// Wrap a transport for shared ownership between the RPC layer and the
/// inbound router.
pub type SharedTransport = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_invalid_command_fails() {
        let result = ProcessTransport::spawn(
            "/nonexistent/agent-binary",
            &[],
            &HashMap::new(),
            None,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn channel_pair_round_trip() {
        let (a, b) = ChannelTransport::pair(8);

        a.send("ping".to_string()).await.unwrap();
        assert_eq!(b.recv().await, Some("ping".to_string()));

        b.send("pong".to_string()).await.unwrap();
        assert_eq!(a.recv().await, Some("pong".to_string()));
    }

    #[tokio::test]
    async fn channel_close_signals_peer() {
        let (a, b) = ChannelTransport::pair(8);
        a.close().await;
        assert_eq!(b.recv().await, None);
    }
}
