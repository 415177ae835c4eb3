// SPDX-License-Identifier: Apache-2.0
//! C4 — MCP session: handshake, tool catalog cache, and tool invocation.
//!
//! One [`McpSession`] owns one child connection end to end: `initialize`,
//! `tools/list` (cached), and `tools/call` with progress-driven inactivity
//! timeout plus a hard ceiling that fires regardless of progress.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec::Frame;
use crate::dispatcher::Dispatcher;
use crate::error::McpError;
use crate::transport::{ChildTransport, TransportSpec};

/// No progress notification in this long resets the inactivity timer; if
/// none arrives before it elapses, the call fails with `ToolTimeout`.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
/// A call is killed after this long no matter how much progress it reports.
pub const DEFAULT_HARD_CEILING: Duration = Duration::from_secs(30 * 60);

const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Starting = 0,
    Initialized = 1,
    Ready = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Initialized,
            2 => Self::Ready,
            3 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One tool's descriptor, as reported by `tools/list`.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Result of a successful `tools/call`. A `result.isError` response is not
/// represented here — it fails `call_tool` with `ToolInvocationFailed`
/// instead, per the handshake contract in §4.4 step 5.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub content: Value,
}

#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub inactivity_timeout: Duration,
    pub hard_ceiling: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self { inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT, hard_ceiling: DEFAULT_HARD_CEILING }
    }
}

/// A live, handshaken connection to one MCP server child.
pub struct McpSession {
    pub server_name: String,
    dispatcher: Arc<Dispatcher>,
    state: AtomicU8,
    tools: RwLock<Option<Vec<ToolDescriptor>>>,
    limits: SessionLimits,
    call_lock: Mutex<()>,
}

impl McpSession {
    /// Connect, spawn the dispatcher, and run `initialize`. The session is
    /// left in `Initialized` on success; callers should follow with
    /// [`McpSession::list_tools`] to reach `Ready`.
    pub async fn start(
        server_name: impl Into<String>,
        spec: &TransportSpec,
        limits: SessionLimits,
    ) -> Result<Self, McpError> {
        let server_name = server_name.into();
        let transport = ChildTransport::connect(spec).await?;
        let dispatcher = Dispatcher::spawn(Arc::new(transport));

        let session = Self {
            server_name: server_name.clone(),
            dispatcher,
            state: AtomicU8::new(SessionState::Starting as u8),
            tools: RwLock::new(None),
            limits,
            call_lock: Mutex::new(()),
        };

        session.handshake().await?;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: SessionState) {
        self.state.store(s as u8, Ordering::Release);
    }

    async fn handshake(&self) -> Result<(), McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "conduit", "version": env!("CARGO_PKG_VERSION") },
        });
        self.request("initialize", params).await.map_err(|e| McpError::HandshakeFailed {
            server: self.server_name.clone(),
            reason: e.to_string(),
        })?;
        self.dispatcher
            .send(Frame::Notification { method: "notifications/initialized".into(), params: Value::Null })
            .await
            .map_err(|e| McpError::HandshakeFailed { server: self.server_name.clone(), reason: e.to_string() })?;
        self.set_state(SessionState::Initialized);
        Ok(())
    }

    /// Fetch and cache the tool catalog. Idempotent: subsequent calls return
    /// the cached list without another round trip.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        if let Some(cached) = self.tools.read().await.clone() {
            return Ok(cached);
        }
        let result = self.request("tools/list", Value::Null).await.map_err(|e| {
            McpError::ToolCatalogUnavailable { server: self.server_name.clone(), reason: e.to_string() }
        })?;
        let tools: Vec<ToolDescriptor> = result
            .get("tools")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| McpError::ToolCatalogUnavailable {
                server: self.server_name.clone(),
                reason: format!("malformed tool descriptor: {e}"),
            })?
            .unwrap_or_default();
        *self.tools.write().await = Some(tools.clone());
        self.set_state(SessionState::Ready);
        Ok(tools)
    }

    /// Invoke `tool_name` with `arguments`. Progress notifications reset the
    /// inactivity timer; if neither a response nor progress arrives within
    /// the window, or the hard ceiling elapses, the call fails with
    /// `ToolTimeout` and the pending request slot is released.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolCallOutcome, McpError> {
        let _serialize = self.call_lock.lock().await;
        let token = Uuid::new_v4().to_string();
        let id = self.dispatcher.next_request_id();
        let rx = self.dispatcher.register(&id).await;
        let mut progress_rx = self.dispatcher.subscribe_progress(token.clone()).await;

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
            "_meta": { "progressToken": token },
        });
        if let Err(e) = self.dispatcher.send(Frame::request(id.clone(), "tools/call", params)).await {
            self.dispatcher.unregister(&id).await;
            self.dispatcher.unsubscribe_progress(&token).await;
            return Err(e);
        }

        let deadline = Instant::now() + self.limits.hard_ceiling;
        let mut inactivity = interval(self.limits.inactivity_timeout);
        inactivity.tick().await; // first tick fires immediately; consume it

        tokio::pin!(rx);
        let outcome = loop {
            tokio::select! {
                result = &mut rx => {
                    break result.map_err(|_| McpError::TransportClosed("dispatcher dropped".into()))?;
                }
                _ = progress_rx.changed() => {
                    inactivity.reset();
                    continue;
                }
                _ = inactivity.tick() => {
                    self.dispatcher.unregister(&id).await;
                    break Err(McpError::ToolTimeout(format!(
                        "no progress on {tool_name:?} within {:?}", self.limits.inactivity_timeout
                    )));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.dispatcher.unregister(&id).await;
                    break Err(McpError::ToolTimeout(format!(
                        "{tool_name:?} exceeded hard ceiling of {:?}", self.limits.hard_ceiling
                    )));
                }
            }
        };
        self.dispatcher.unsubscribe_progress(&token).await;

        let frame = outcome?;
        match frame {
            Frame::Response { result: Some(r), .. } => {
                let content = r.get("content").cloned().unwrap_or(Value::Null);
                if r.get("isError").and_then(Value::as_bool).unwrap_or(false) {
                    let detail = r
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| render_content(&content));
                    return Err(McpError::ToolInvocationFailed(detail));
                }
                Ok(ToolCallOutcome { content })
            }
            Frame::Response { error: Some(e), .. } => {
                Err(McpError::ToolInvocationFailed(e.get("message").and_then(Value::as_str).unwrap_or("unknown error").to_string()))
            }
            _ => Err(McpError::ToolInvocationFailed("response carried neither result nor error".into())),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, McpError> {
        let id = self.dispatcher.next_request_id();
        let rx = self.dispatcher.register(&id).await;
        if let Err(e) = self.dispatcher.send(Frame::request(id.clone(), method, params)).await {
            self.dispatcher.unregister(&id).await;
            return Err(e);
        }
        let frame = rx.await.map_err(|_| McpError::TransportClosed("dispatcher dropped".into()))??;
        match frame {
            Frame::Response { result: Some(r), .. } => Ok(r),
            Frame::Response { error: Some(e), .. } => {
                Err(McpError::ToolInvocationFailed(e.get("message").and_then(Value::as_str).unwrap_or("unknown error").to_string()))
            }
            _ => Err(McpError::ToolInvocationFailed("response carried neither result nor error".into())),
        }
    }

    /// Close the session: `Ready`/`Initialized` → `Closing` → `Closed`.
    pub async fn close(&self) {
        self.set_state(SessionState::Closing);
        self.dispatcher.stop().await;
        self.set_state(SessionState::Closed);
        info!(server = %self.server_name, "session closed");
    }
}

/// Render an `isError` result's `content` as plain text when the response
/// carries no separate `error` string to fall back on.
fn render_content(content: &Value) -> String {
    if let Some(arr) = content.as_array() {
        arr.iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    } else if let Some(s) = content.as_str() {
        s.to_string()
    } else {
        content.to_string()
    }
}
