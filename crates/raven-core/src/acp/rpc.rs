//! Outbound JSON-RPC correlation
//!
//! Assigns request ids, pairs responses with their pending callers, and
//! rejects everything in flight exactly once when the connection dies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{AcpError, Error, Result};
use crate::types::{JsonRpcRequest, JsonRpcResponse};

use super::transport::SharedTransport;

/// Tracks in-flight outbound requests against their responses.
pub struct RpcCorrelator {
    transport: SharedTransport,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<serde_json::Value>>>>,
    closed: AtomicBool,
}

impl RpcCorrelator {
    pub fn new(transport: SharedTransport) -> Arc<Self> {
        Arc::new(Self {
            transport,
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Send a request and wait for the matching response.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            // Checked under the pending lock: reject_all closes and drains
            // while holding it, so a racing call cannot slip a sender into
            // the table after the drain and hang forever.
            let mut pending = self.pending.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(AcpError::ConnectionClosed.into());
            }
            pending.insert(id, tx);
        }

        let request = JsonRpcRequest::new(id, method, params);
        let frame = serde_json::to_string(&request)?;
        debug!(method, id, "sending request");

        if let Err(e) = self.transport.send(frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        // A dropped sender means reject_all already ran and drained us, or
        // the correlator itself went away.
        rx.await.map_err(|_| Error::from(AcpError::ConnectionClosed))?
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let request = JsonRpcRequest::notification(method, params);
        let frame = serde_json::to_string(&request)?;
        debug!(method, "sending notification");
        self.transport.send(frame).await
    }

    /// Route an inbound response frame to its waiting caller.
    pub async fn handle_response(&self, response: JsonRpcResponse) {
        let id = match response.id.as_ref().and_then(|v| v.as_u64()) {
            Some(id) => id,
            None => {
                warn!("response frame without a numeric id, dropping");
                return;
            }
        };

        let sender = self.pending.lock().await.remove(&id);
        let Some(sender) = sender else {
            warn!(id, "response for unknown or already-settled request");
            return;
        };

        let outcome = match response.error {
            Some(err) => Err(AcpError::Rpc {
                code: err.code,
                message: err.message,
            }
            .into()),
            None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
        };

        // Receiver may have given up; nothing to do then.
        let _ = sender.send(outcome);
    }

    /// Fail every pending request with a connection error. Idempotent.
    pub async fn reject_all(&self) {
        let mut pending = self.pending.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        for (id, sender) in pending.drain() {
            debug!(id, "rejecting pending request on disconnect");
            let _ = sender.send(Err(AcpError::ConnectionClosed.into()));
        }
    }

    #[cfg(test)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Inbound frame, classified by the JSON-RPC envelope shape.
#[derive(Debug)]
pub enum InboundFrame {
    /// Has an `id` but no `method`: a response to one of our requests.
    Response(JsonRpcResponse),
    /// Has both `method` and `id`: the agent expects an answer.
    Request(JsonRpcRequest),
    /// Has a `method` but no `id`: fire-and-forget.
    Notification(JsonRpcRequest),
}

/// Classify a parsed frame by the presence of `method` and `id`.
pub fn classify_frame(value: serde_json::Value) -> Result<InboundFrame> {
    let has_method = value.get("method").is_some();
    let has_id = value.get("id").map(|v| !v.is_null()).unwrap_or(false);

    match (has_method, has_id) {
        (false, true) => {
            let response: JsonRpcResponse = serde_json::from_value(value)?;
            Ok(InboundFrame::Response(response))
        }
        (true, true) => {
            let request: JsonRpcRequest = serde_json::from_value(value)?;
            Ok(InboundFrame::Request(request))
        }
        (true, false) => {
            let request: JsonRpcRequest = serde_json::from_value(value)?;
            Ok(InboundFrame::Notification(request))
        }
        (false, false) => Err(AcpError::InvalidMessage(
            "frame has neither method nor id".to_string(),
        )
        .into()),
    }
}
