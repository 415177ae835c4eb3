// SPDX-License-Identifier: Apache-2.0
//! Error taxonomy owned by the orchestration loop and budget manager
//! (C8/C9). Provider and MCP errors surface through their own crates and
//! are wrapped here only where the loop needs to react to them uniformly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// C9: even after eliding every eligible group down to `keep_recent`,
    /// the log still exceeds the ceiling. The caller must either raise the
    /// ceiling, lower `keep_recent`, or fail the turn outright.
    #[error("context overflow: {tokens} tokens exceeds ceiling of {ceiling} after full elision")]
    ContextOverflow { tokens: usize, ceiling: usize },

    /// An in-flight turn was cancelled by the caller (Ctrl-C, shutdown).
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Provider(#[from] anyhow::Error),

    #[error(transparent)]
    Mcp(#[from] conduit_mcp::McpError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
