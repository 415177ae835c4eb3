// SPDX-License-Identifier: Apache-2.0
//! Error taxonomy for the MCP client engine (§7 of the design: C1–C5 origins).

use thiserror::Error;

/// Errors the MCP engine produces, grouped by the component that raises them.
#[derive(Debug, Error)]
pub enum McpError {
    /// C1: a line could not be decoded as UTF-8 JSON.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// C1: a line exceeded the configured size ceiling.
    #[error("oversized frame: {size} bytes exceeds ceiling of {ceiling} bytes")]
    OversizedFrame { size: usize, ceiling: usize },

    /// C2/C3: the transport closed (EOF, process exit, socket drop) while a
    /// caller was still waiting on it.
    #[error("transport closed: {0}")]
    TransportClosed(String),

    /// C4: the `initialize` handshake failed or timed out.
    #[error("handshake with MCP server {server:?} failed: {reason}")]
    HandshakeFailed { server: String, reason: String },

    /// C4: `tools/list` failed or timed out after a successful handshake.
    #[error("tool catalog unavailable for server {server:?}: {reason}")]
    ToolCatalogUnavailable { server: String, reason: String },

    /// C4/C5: the child reported an error result, or the call never got a
    /// response at all (distinguished from `ToolTimeout`).
    #[error("tool invocation failed: {0}")]
    ToolInvocationFailed(String),

    /// C4: neither a response nor a progress notification arrived within the
    /// inactivity window, or the hard ceiling elapsed.
    #[error("tool call timed out: {0}")]
    ToolTimeout(String),

    /// C5: no connected server claims the requested tool name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Any layer: an in-flight operation was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, McpError>;
