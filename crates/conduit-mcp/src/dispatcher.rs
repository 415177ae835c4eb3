// SPDX-License-Identifier: Apache-2.0
//! C3 — response dispatcher.
//!
//! One task owns the transport's read side and fans incoming frames out to
//! whoever is waiting: a response by request id, or a progress notification
//! by its `progressToken`. Progress delivery is a single buffered slot (a
//! [`tokio::sync::watch`] channel) — a slow consumer sees only the latest
//! progress, never a backlog, since progress exists to reset an inactivity
//! timer, not to be replayed in full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{trace, warn};

use crate::codec::Frame;
use crate::error::McpError;
use crate::transport::ChildTransport;

/// A `notifications/progress` payload, keyed by `progressToken` by the caller.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub progress: f64,
    pub total: Option<f64>,
}

struct Pending {
    reply: oneshot::Sender<Result<Frame, McpError>>,
}

/// Routes responses and progress notifications from one MCP child back to
/// the callers waiting on them. Construct with [`Dispatcher::spawn`], which
/// takes ownership of the transport's read loop.
pub struct Dispatcher {
    transport: Arc<ChildTransport>,
    pending: Mutex<HashMap<String, Pending>>,
    progress: Mutex<HashMap<String, watch::Sender<ProgressUpdate>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    /// Start the dispatcher. Spawns the background task that drains
    /// `transport.recv()` for the lifetime of the transport.
    pub fn spawn(transport: Arc<ChildTransport>) -> Arc<Self> {
        let this = Arc::new(Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        let worker = this.clone();
        tokio::spawn(async move {
            worker.drain_loop().await;
        });
        this
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            match self.transport.recv().await {
                Some(Ok(frame)) => self.route(frame).await,
                Some(Err(e)) => {
                    warn!(error = %e, "transport error, draining pending requests");
                    self.fail_all(e).await;
                    break;
                }
                None => {
                    self.fail_all(McpError::TransportClosed("dispatcher channel closed".into())).await;
                    break;
                }
            }
        }
    }

    async fn route(&self, frame: Frame) {
        match frame {
            Frame::Response { ref id, .. } => {
                let key = id_key(id);
                let mut pending = self.pending.lock().await;
                if let Some(p) = pending.remove(&key) {
                    let _ = p.reply.send(Ok(frame));
                } else {
                    trace!(id = %key, "response for unknown or already-resolved request");
                }
            }
            Frame::Notification { ref method, ref params } if method == "notifications/progress" => {
                let Some(token) = params.get("progressToken").and_then(progress_token_key) else {
                    return;
                };
                let progress = self.progress.lock().await;
                if let Some(tx) = progress.get(&token) {
                    let update = ProgressUpdate {
                        progress: params.get("progress").and_then(Value::as_f64).unwrap_or(0.0),
                        total: params.get("total").and_then(Value::as_f64),
                    };
                    // watch::send overwrites the single slot; a lagging receiver
                    // simply never sees superseded progress values.
                    let _ = tx.send(update);
                }
            }
            Frame::Notification { method, .. } => {
                trace!(%method, "ignoring unhandled notification");
            }
            Frame::Request { id, method, .. } => {
                trace!(%method, "server-initiated request unsupported, replying method-not-found");
                let reply = Frame::Response {
                    id,
                    result: None,
                    error: Some(serde_json::json!({
                        "code": -32601,
                        "message": format!("method not found: {method}"),
                    })),
                };
                if let Err(e) = self.transport.send(reply).await {
                    warn!(error = %e, "failed to send method-not-found reply");
                }
            }
        }
    }

    async fn fail_all(&self, err: McpError) {
        let mut pending = self.pending.lock().await;
        for (_, p) in pending.drain() {
            let _ = p.reply.send(Err(clone_error(&err)));
        }
    }

    /// Allocate a fresh request id, unique for the life of this dispatcher.
    pub fn next_request_id(&self) -> Value {
        Value::from(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register interest in the response for `id`, returning the receiver.
    /// Call before sending the request to avoid a race with a fast reply.
    pub async fn register(&self, id: &Value) -> oneshot::Receiver<Result<Frame, McpError>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id_key(id), Pending { reply: tx });
        rx
    }

    /// Drop interest in `id` without waiting for a reply (used on timeout
    /// and cancellation so a late response doesn't leak a pending slot).
    pub async fn unregister(&self, id: &Value) {
        self.pending.lock().await.remove(&id_key(id));
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Subscribe to progress notifications carrying `token`. Drop the
    /// receiver (or call [`Dispatcher::unsubscribe_progress`]) when done.
    pub async fn subscribe_progress(&self, token: String) -> watch::Receiver<ProgressUpdate> {
        let mut progress = self.progress.lock().await;
        let rx = progress
            .entry(token)
            .or_insert_with(|| watch::channel(ProgressUpdate::default()).0)
            .subscribe();
        rx
    }

    pub async fn unsubscribe_progress(&self, token: &str) {
        self.progress.lock().await.remove(token);
    }

    /// Send `frame` over the owned transport.
    pub async fn send(&self, frame: Frame) -> Result<(), McpError> {
        self.transport.send(frame).await
    }

    pub async fn stop(&self) {
        self.transport.stop().await;
    }
}

fn id_key(v: &Value) -> String {
    // Request ids are either numbers or strings per JSON-RPC; normalize to a
    // string key so both compare equal the way the protocol intends.
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn progress_token_key(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn clone_error(e: &McpError) -> McpError {
    match e {
        McpError::TransportClosed(s) => McpError::TransportClosed(s.clone()),
        McpError::MalformedFrame(s) => McpError::MalformedFrame(s.clone()),
        McpError::OversizedFrame { size, ceiling } => {
            McpError::OversizedFrame { size: *size, ceiling: *ceiling }
        }
        McpError::HandshakeFailed { server, reason } => {
            McpError::HandshakeFailed { server: server.clone(), reason: reason.clone() }
        }
        McpError::ToolCatalogUnavailable { server, reason } => {
            McpError::ToolCatalogUnavailable { server: server.clone(), reason: reason.clone() }
        }
        McpError::ToolInvocationFailed(s) => McpError::ToolInvocationFailed(s.clone()),
        McpError::ToolTimeout(s) => McpError::ToolTimeout(s.clone()),
        McpError::UnknownTool(s) => McpError::UnknownTool(s.clone()),
        McpError::Cancelled => McpError::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportSpec;

    async fn echo_transport() -> Arc<ChildTransport> {
        let script = "while IFS= read -r line; do id=$(echo \"$line\" | sed -n 's/.*\"id\":\\([0-9]*\\).*/\\1/p'); \
                       printf '{\"jsonrpc\":\"2.0\",\"id\":%s,\"result\":{\"ok\":true}}\\n' \"$id\"; done";
        let spec = TransportSpec::Stdio {
            command: "sh".into(),
            args: vec!["-c".into(), script.to_string()],
            env: vec![],
            tee_stderr: false,
        };
        Arc::new(ChildTransport::connect(&spec).await.unwrap())
    }

    #[tokio::test]
    async fn request_resolves_to_its_own_response() {
        let transport = echo_transport().await;
        let dispatcher = Dispatcher::spawn(transport);
        let id = dispatcher.next_request_id();
        let rx = dispatcher.register(&id).await;
        dispatcher.send(Frame::request(id, "ping", Value::Null)).await.unwrap();
        let frame = rx.await.unwrap().unwrap();
        assert!(matches!(frame, Frame::Response { result: Some(_), .. }));
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn unregistered_request_does_not_leak_pending_slot() {
        let transport = echo_transport().await;
        let dispatcher = Dispatcher::spawn(transport);
        let id = dispatcher.next_request_id();
        let _rx = dispatcher.register(&id).await;
        assert_eq!(dispatcher.pending_count().await, 1);
        dispatcher.unregister(&id).await;
        assert_eq!(dispatcher.pending_count().await, 0);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn transport_closure_fails_all_pending_requests() {
        let transport = echo_transport().await;
        let dispatcher = Dispatcher::spawn(transport);
        let id = dispatcher.next_request_id();
        let rx = dispatcher.register(&id).await;
        dispatcher.stop().await;
        let result = rx.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn server_initiated_request_gets_method_not_found_reply() {
        // The child immediately sends an unsolicited request (simulating a
        // server-initiated call the host doesn't support), then captures
        // whatever the dispatcher writes back to stdin into a file so the
        // test can inspect it without racing the dispatcher's own reader
        // loop for `transport.recv()`.
        let capture = tempfile::NamedTempFile::new().unwrap();
        let capture_path = capture.path().to_str().unwrap().to_string();
        let script = format!(
            "printf '{{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"sampling/createMessage\",\"params\":{{}}}}\\n'; \
             read -r reply; printf '%s' \"$reply\" > {capture_path}"
        );
        let spec = TransportSpec::Stdio {
            command: "sh".into(),
            args: vec!["-c".into(), script],
            env: vec![],
            tee_stderr: false,
        };
        let transport = Arc::new(ChildTransport::connect(&spec).await.unwrap());
        let _dispatcher = Dispatcher::spawn(transport);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        let captured = loop {
            let contents = tokio::fs::read_to_string(&capture_path).await.unwrap_or_default();
            if !contents.trim().is_empty() {
                break contents;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("dispatcher never replied to the server-initiated request");
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        };

        let reply: Value = serde_json::from_str(captured.trim()).unwrap();
        assert_eq!(reply["id"], Value::from(7));
        assert!(reply.get("result").is_none());
        assert_eq!(reply["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn progress_subscriber_sees_latest_value_only() {
        let transport = echo_transport().await;
        let dispatcher = Dispatcher::spawn(transport);
        let mut rx = dispatcher.subscribe_progress("tok-1".into()).await;
        dispatcher
            .route(Frame::Notification {
                method: "notifications/progress".into(),
                params: serde_json::json!({"progressToken": "tok-1", "progress": 1.0, "total": 10.0}),
            })
            .await;
        dispatcher
            .route(Frame::Notification {
                method: "notifications/progress".into(),
                params: serde_json::json!({"progressToken": "tok-1", "progress": 5.0, "total": 10.0}),
            })
            .await;
        rx.changed().await.unwrap();
        let latest = rx.borrow_and_update().clone();
        assert_eq!(latest.progress, 5.0);
        dispatcher.stop().await;
    }
}
