// SPDX-License-Identifier: Apache-2.0
//! C8 — the orchestration loop.
//!
//! Drives one user turn through `Idle -> AwaitingModel -> ExecutingTools ->
//! (AwaitingModel | Terminated)`. Each round: ask the model for a
//! completion (consuming its stream through [`StreamAccumulator`], which
//! plays the role of C7), run any requested tool calls sequentially through
//! the [`ServerManager`], append results, and loop — until the model
//! produces a plain text answer, `MAX_ITERATIONS` is reached, or the
//! context budget forces a stop it cannot recover from.

use std::collections::BTreeMap;
use std::sync::Arc;

use conduit_llm::{CompletionRequest, FunctionCall, Message, MessageContent, ModelProvider, ResponseEvent, ToolSchema};
use conduit_mcp::ServerManager;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::budget::BudgetPolicy;
use crate::error::{CoreError, Result};
use crate::events::{DisplaySink, OrchestratorEvent};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    AwaitingModel,
    ExecutingTools,
    Terminated,
}

/// Accumulates streamed [`ResponseEvent`]s into one turn's outcome (C7: the
/// per-provider wire decoding already happened inside the provider; this is
/// the orchestration-level accumulation of text and tool-call fragments).
#[derive(Default)]
struct StreamAccumulator {
    text: String,
    tool_calls: BTreeMap<u32, PendingToolCall>,
    usage: Option<conduit_llm::Usage>,
    hit_max_tokens: bool,
}

#[derive(Default, Clone)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAccumulator {
    fn apply(&mut self, event: ResponseEvent, sink: &dyn DisplaySink) {
        match event {
            ResponseEvent::TextDelta(delta) => {
                sink.emit(OrchestratorEvent::TextDelta(delta.clone()));
                self.text.push_str(&delta);
            }
            ResponseEvent::ThinkingDelta(delta) => {
                sink.emit(OrchestratorEvent::ThinkingDelta(delta));
            }
            ResponseEvent::ToolCall { index, id, name, arguments } => {
                let entry = self.tool_calls.entry(index).or_default();
                if !id.is_empty() {
                    entry.id = id;
                }
                if !name.is_empty() {
                    entry.name = name;
                }
                entry.arguments.push_str(&arguments);
            }
            ResponseEvent::Usage { input_tokens, output_tokens, cache_read_tokens, cache_write_tokens } => {
                self.usage = Some(conduit_llm::Usage {
                    input_tokens,
                    output_tokens,
                    cache_read_tokens,
                    cache_write_tokens,
                });
            }
            ResponseEvent::MaxTokens => self.hit_max_tokens = true,
            ResponseEvent::Done => {}
            ResponseEvent::Error(e) => sink.emit(OrchestratorEvent::Error(e)),
        }
    }

    fn tool_calls_in_order(&self) -> Vec<PendingToolCall> {
        self.tool_calls.values().cloned().collect()
    }
}

pub struct Orchestrator {
    provider: Box<dyn ModelProvider>,
    manager: Arc<ServerManager>,
    budget: BudgetPolicy,
    sink: Arc<dyn DisplaySink>,
    max_iterations: u32,
    state: LoopState,
}

impl Orchestrator {
    pub fn new(
        provider: Box<dyn ModelProvider>,
        manager: Arc<ServerManager>,
        budget: BudgetPolicy,
        sink: Arc<dyn DisplaySink>,
        max_iterations: u32,
    ) -> Self {
        Self { provider, manager, budget, sink, max_iterations, state: LoopState::Idle }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.manager
            .tools()
            .into_iter()
            .map(|t| ToolSchema {
                name: t.name,
                description: t.description.unwrap_or_default(),
                parameters: t.input_schema,
            })
            .collect()
    }

    /// Run one user turn to completion: push the user message, loop model
    /// and tool rounds, and return the final assistant text.
    pub async fn run_turn(&mut self, session: &mut Session, user_input: String) -> Result<String> {
        session.push(Message::user(user_input));

        let mut iterations = 0u32;
        loop {
            if self.budget.should_elide(session) {
                let before = session.token_count;
                match self.budget.elide(session) {
                    Ok(stats) => {
                        self.sink.emit(OrchestratorEvent::ContextCompacted {
                            tokens_before: stats.tokens_before,
                            tokens_after: stats.tokens_after,
                        });
                    }
                    Err(CoreError::ContextOverflow { tokens, ceiling }) => {
                        warn!(tokens, ceiling, before, "context overflow even after full elision");
                        return Err(CoreError::ContextOverflow { tokens, ceiling });
                    }
                    Err(e) => return Err(e),
                }
            }

            if iterations >= self.max_iterations {
                self.sink.emit(OrchestratorEvent::MaxIterationsReached { iterations });
                self.state = LoopState::Terminated;
                return Ok(self.last_assistant_text(session));
            }

            self.state = LoopState::AwaitingModel;
            let request = CompletionRequest {
                messages: session.messages.clone(),
                tools: self.tool_schemas(),
                stream: true,
                system_dynamic_suffix: None,
                cache_key: None,
            };

            let mut stream = self.provider.complete(request).await.map_err(CoreError::Provider)?;
            let mut acc = StreamAccumulator::default();
            while let Some(event) = stream.next().await {
                let event = event.map_err(CoreError::Provider)?;
                acc.apply(event, self.sink.as_ref());
            }

            let tool_calls = acc.tool_calls_in_order();
            if !acc.text.is_empty() {
                self.sink.emit(OrchestratorEvent::TextComplete(acc.text.clone()));
            }
            if let Some(usage) = &acc.usage {
                self.sink.emit(OrchestratorEvent::TokenUsage {
                    input: usage.input_tokens,
                    output: usage.output_tokens,
                    context_total: session.token_count,
                    cache_read: usage.cache_read_tokens,
                    cache_write: usage.cache_write_tokens,
                });
            }

            if tool_calls.is_empty() {
                if !acc.text.is_empty() {
                    session.push(Message::assistant(acc.text.clone()));
                }
                self.sink.emit(OrchestratorEvent::TurnComplete);
                self.state = LoopState::Terminated;
                return Ok(acc.text);
            }

            if !acc.text.is_empty() {
                session.push(Message::assistant(acc.text.clone()));
            }
            for call in &tool_calls {
                session.push(Message {
                    role: conduit_llm::Role::Assistant,
                    content: MessageContent::ToolCall {
                        tool_call_id: call.id.clone(),
                        function: FunctionCall { name: call.name.clone(), arguments: call.arguments.clone() },
                    },
                });
            }

            self.state = LoopState::ExecutingTools;
            // Sequential, not parallel: later tool calls in a turn may depend
            // on the side effects of earlier ones.
            for call in &tool_calls {
                self.sink.emit(OrchestratorEvent::ToolCallStarted {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    arguments: parse_arguments(&call.arguments),
                });

                let arguments = parse_arguments(&call.arguments);
                // A `result.isError` response already failed inside
                // `call_tool` (McpSession), so `Ok` here always means success.
                let (output, is_error) = match self.manager.execute_tool(&call.name, arguments).await {
                    Ok(outcome) => (render_tool_content(&outcome.content), false),
                    // Structured "ERROR: <kind>: <detail>" so the model can
                    // recognize and recover from the failure.
                    Err(e) => (format!("ERROR: {e}"), true),
                };

                self.sink.emit(OrchestratorEvent::ToolCallFinished {
                    call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    output: output.clone(),
                    is_error,
                });
                session.push(Message::tool_result(call.id.clone(), output));
            }

            iterations += 1;
            debug!(iterations, "completed one model/tool round");
        }
    }

    fn last_assistant_text(&self, session: &Session) -> String {
        session
            .messages
            .iter()
            .rev()
            .find_map(|m| m.as_text().map(str::to_string))
            .unwrap_or_default()
    }
}

fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn render_tool_content(content: &serde_json::Value) -> String {
    if let Some(arr) = content.as_array() {
        arr.iter()
            .filter_map(|part| part.get("text").and_then(serde_json::Value::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    } else if let Some(s) = content.as_str() {
        s.to_string()
    } else {
        content.to_string()
    }
}
