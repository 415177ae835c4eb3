// SPDX-License-Identifier: Apache-2.0
//! Events the orchestration loop emits as it runs a turn. The display sink
//! (§4.7) subscribes to these; nothing in this crate renders them.

/// One event emitted while the loop runs a single user turn.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// A text chunk streamed from the model.
    TextDelta(String),
    /// The complete text response for the turn, once streaming finishes.
    TextComplete(String),
    /// A reasoning/thinking chunk, for providers that stream it separately.
    ThinkingDelta(String),
    ThinkingComplete(String),
    /// The model requested a tool call; dispatch is about to begin.
    ToolCallStarted { call_id: String, tool_name: String, arguments: serde_json::Value },
    /// A tool call finished, successfully or not.
    ToolCallFinished { call_id: String, tool_name: String, output: String, is_error: bool },
    /// The context budget manager elided part of the history (C9).
    ContextCompacted { tokens_before: usize, tokens_after: usize },
    /// Token usage reported for the turn just completed.
    TokenUsage {
        input: u32,
        output: u32,
        context_total: usize,
        cache_read: u32,
        cache_write: u32,
    },
    /// The loop reached `MAX_ITERATIONS` without the model producing a final
    /// answer (§7: not a failure, a forced stop).
    MaxIterationsReached { iterations: u32 },
    /// The loop finished the current user turn.
    TurnComplete,
    /// A recoverable error occurred mid-turn (the loop continues if possible).
    Error(String),
}

/// Receives [`OrchestratorEvent`]s as the loop runs. Implemented by CLI
/// renderers; a no-op sink is useful in tests.
pub trait DisplaySink: Send + Sync {
    fn emit(&self, event: OrchestratorEvent);
}

/// Drops every event. Used where a caller needs a sink but doesn't render.
pub struct NullSink;

impl DisplaySink for NullSink {
    fn emit(&self, _event: OrchestratorEvent) {}
}

/// Collects every event in order, for tests that assert on the event stream.
#[derive(Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<OrchestratorEvent>>,
}

impl DisplaySink for RecordingSink {
    fn emit(&self, event: OrchestratorEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OrchestratorEvent> {
        self.events.lock().unwrap().clone()
    }
}
