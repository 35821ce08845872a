//! Local terminal backing for agent `terminal/*` requests
//!
//! Each created terminal runs one command. Output from stdout and stderr is
//! collected into a shared buffer capped at the requested byte limit; a
//! monitor task owns the child and records its exit status for waiters.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, warn};

use crate::acp::TerminalManager;
use crate::error::{AcpError, Result};
use crate::types::{
    TerminalCreateParams, TerminalCreateResult, TerminalExitStatus, TerminalOutputResult,
};

const DEFAULT_OUTPUT_BYTE_LIMIT: u64 = 1024 * 1024;

struct OutputBuffer {
    data: String,
    truncated: bool,
    limit: usize,
}

impl OutputBuffer {
    fn append(&mut self, chunk: &str) {
        let remaining = self.limit.saturating_sub(self.data.len());
        if chunk.len() <= remaining {
            self.data.push_str(chunk);
            return;
        }
        self.truncated = true;
        if remaining > 0 {
            // Cut on a char boundary at or below the byte budget.
            let mut cut = remaining;
            while cut > 0 && !chunk.is_char_boundary(cut) {
                cut -= 1;
            }
            self.data.push_str(&chunk[..cut]);
        }
    }
}

struct TerminalHandle {
    output: Arc<Mutex<OutputBuffer>>,
    exit_rx: watch::Receiver<Option<TerminalExitStatus>>,
    kill_signal: Arc<Notify>,
}

/// Runs agent-requested commands as local subprocesses.
#[derive(Default)]
pub struct LocalTerminalManager {
    terminals: Mutex<HashMap<String, TerminalHandle>>,
    counter: AtomicU64,
}

impl LocalTerminalManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn handle_field<T>(
        &self,
        terminal_id: &str,
        f: impl FnOnce(&TerminalHandle) -> T,
    ) -> Result<T> {
        let terminals = self.terminals.lock().await;
        let handle = terminals
            .get(terminal_id)
            .ok_or_else(|| AcpError::TerminalNotFound(terminal_id.to_string()))?;
        Ok(f(handle))
    }
}

#[async_trait]
impl TerminalManager for LocalTerminalManager {
    async fn create(&self, params: TerminalCreateParams) -> Result<TerminalCreateResult> {
        let mut cmd = Command::new(&params.command);
        cmd.args(params.args.as_deref().unwrap_or_default())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &params.cwd {
            cmd.current_dir(cwd);
        }
        for var in params.env.as_deref().unwrap_or_default() {
            cmd.env(&var.name, &var.value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AcpError::SpawnFailed(format!("{}: {}", params.command, e)))?;

        let limit = params
            .output_byte_limit
            .unwrap_or(DEFAULT_OUTPUT_BYTE_LIMIT) as usize;
        let output = Arc::new(Mutex::new(OutputBuffer {
            data: String::new(),
            truncated: false,
            limit,
        }));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(collect_output(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(collect_output(stderr, output.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_signal = Arc::new(Notify::new());

        let terminal_id = format!(
            "{}_{}",
            params.session_id,
            self.counter.fetch_add(1, Ordering::SeqCst)
        );
        debug!(terminal_id = %terminal_id, command = %params.command, "terminal created");

        // Monitor owns the child: waits for exit, and turns a kill request
        // into SIGKILL while continuing to wait for the real status.
        let kill_signal2 = kill_signal.clone();
        tokio::spawn(async move {
            let mut kill_requested = false;
            loop {
                tokio::select! {
                    status = child.wait() => {
                        let exit = match status {
                            Ok(status) => TerminalExitStatus {
                                exit_code: status.code(),
                                signal: exit_signal_name(&status),
                            },
                            Err(e) => {
                                warn!("terminal wait failed: {}", e);
                                TerminalExitStatus { exit_code: None, signal: None }
                            }
                        };
                        let _ = exit_tx.send(Some(exit));
                        break;
                    }
                    _ = kill_signal2.notified(), if !kill_requested => {
                        kill_requested = true;
                        if let Err(e) = child.start_kill() {
                            warn!("failed to kill terminal process: {}", e);
                        }
                    }
                }
            }
        });

        self.terminals.lock().await.insert(
            terminal_id.clone(),
            TerminalHandle {
                output,
                exit_rx,
                kill_signal,
            },
        );

        Ok(TerminalCreateResult { terminal_id })
    }

    async fn output(&self, _session_id: &str, terminal_id: &str) -> Result<TerminalOutputResult> {
        let (output, exit_rx) = self
            .handle_field(terminal_id, |h| (h.output.clone(), h.exit_rx.clone()))
            .await?;
        let exit_status = exit_rx.borrow().clone();
        let buffer = output.lock().await;
        Ok(TerminalOutputResult {
            output: buffer.data.clone(),
            truncated: buffer.truncated,
            exit_status,
        })
    }

    async fn wait_for_exit(
        &self,
        _session_id: &str,
        terminal_id: &str,
    ) -> Result<TerminalExitStatus> {
        let mut exit_rx = self
            .handle_field(terminal_id, |h| h.exit_rx.clone())
            .await?;
        let status = exit_rx
            .wait_for(|status| status.is_some())
            .await
            .map_err(|_| AcpError::TerminalNotFound(terminal_id.to_string()))?;
        Ok(status.clone().unwrap_or(TerminalExitStatus {
            exit_code: None,
            signal: None,
        }))
    }

    async fn kill(&self, _session_id: &str, terminal_id: &str) -> Result<()> {
        self.handle_field(terminal_id, |h| h.kill_signal.notify_one())
            .await
    }

    async fn release(&self, _session_id: &str, terminal_id: &str) -> Result<()> {
        let handle = self
            .terminals
            .lock()
            .await
            .remove(terminal_id)
            .ok_or_else(|| AcpError::TerminalNotFound(terminal_id.to_string()))?;
        // Still running means nobody will wait on it again; stop it.
        if handle.exit_rx.borrow().is_none() {
            handle.kill_signal.notify_one();
        }
        debug!(terminal_id, "terminal released");
        Ok(())
    }
}

async fn collect_output(
    stream: impl AsyncRead + Unpin + Send + 'static,
    output: Arc<Mutex<OutputBuffer>>,
) {
    let mut stream = stream;
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                output.lock().await.append(&chunk);
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal_name(status: &std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|s| s.to_string())
}

#[cfg(not(unix))]
fn exit_signal_name(_status: &std::process::ExitStatus) -> Option<String> {
    None
}
