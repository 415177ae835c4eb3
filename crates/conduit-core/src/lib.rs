// SPDX-License-Identifier: Apache-2.0
//! Orchestration loop (C8) and context budget manager (C9).
//!
//! This crate owns the model<->tool turn iteration described in the
//! engine's orchestration loop: it drives a [`ModelProvider`] stream from
//! `conduit-llm`, dispatches any requested tool calls through a
//! `conduit_mcp::ServerManager`, and keeps the running message log under
//! budget via [`BudgetPolicy`].

mod budget;
mod error;
mod events;
mod orchestrator;
mod session;

pub use budget::{BudgetPolicy, ElisionStats};
pub use error::{CoreError, Result};
pub use events::{DisplaySink, NullSink, OrchestratorEvent, RecordingSink};
pub use orchestrator::{LoopState, Orchestrator};
pub use session::Session;
