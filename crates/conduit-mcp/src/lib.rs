// SPDX-License-Identifier: Apache-2.0
//! conduit-mcp — the Model Context Protocol client engine.
//!
//! This crate is the engine's only Model Context Protocol client: it spawns
//! or dials MCP server child processes, speaks framed JSON-RPC to them, and
//! exposes an aggregated tool catalog plus routed tool invocation to the
//! orchestration loop. It never serves MCP itself.
//!
//! Layering, outside in:
//! - [`codec`] (C1): one JSON-RPC line in, one [`codec::Frame`] out.
//! - [`transport`] (C2): a stdio child or a Unix socket, same interface.
//! - [`dispatcher`] (C3): one reader loop, routed by request id or progress token.
//! - [`session`] (C4): handshake, tool cache, call_tool with timeouts.
//! - [`manager`] (C5): a named pool of sessions with aggregated routing.

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod session;
pub mod transport;

pub use codec::{Frame, JsonRpcCodec};
pub use dispatcher::{Dispatcher, ProgressUpdate};
pub use error::{McpError, Result};
pub use manager::{resolve_transport, ServerEntry, ServerManager};
pub use session::{McpSession, SessionLimits, SessionState, ToolCallOutcome, ToolDescriptor};
pub use transport::{ChildTransport, TransportSpec};
