// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Ollama driver — OpenAI-compatible wire format plus a text-mode tool-call
//! fallback.
//!
//! Ollama serves the `/v1/chat/completions` endpoint for most models, but
//! several locally-hosted checkpoints (Qwen, older Llama fine-tunes) were not
//! trained against the OpenAI function-calling schema and instead emit calls
//! as plain text wrapped in `<tool_call>{"name": ..., "arguments": ...}</tool_call>`
//! tags. This driver scans the text stream for that pattern and synthesizes
//! structured [`ResponseEvent::ToolCall`] events from it, so the orchestrator
//! never needs to know which shape a given model actually used.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::warn;

use crate::{
    catalog::ModelCatalogEntry,
    openai_compat::{AuthStyle, OpenAICompatProvider},
    provider::ResponseStream,
    CompletionRequest, ResponseEvent,
};

const TAG_OPEN: &str = "<tool_call>";
const TAG_CLOSE: &str = "</tool_call>";

pub struct OllamaProvider {
    inner: OpenAICompatProvider,
}

impl OllamaProvider {
    pub fn new(
        model: String,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            inner: OpenAICompatProvider::new(
                "ollama",
                model,
                None,
                base_url.as_deref().unwrap_or("http://localhost:11434/v1"),
                max_tokens,
                temperature,
                vec![],
                AuthStyle::None,
                serde_json::Value::Null,
            ),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OllamaProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelCatalogEntry>> {
        self.inner.list_models().await
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let upstream = self.inner.complete(req).await?;
        Ok(Box::pin(TextModeToolCallFilter::new(upstream)))
    }
}

/// Wraps an upstream [`ResponseStream`], buffering `TextDelta`s until a
/// complete `<tool_call>...</tool_call>` block is seen (or ruled out), and
/// rewriting matched blocks into [`ResponseEvent::ToolCall`] events.
///
/// Deltas that do not contain a partial tag are passed through immediately so
/// normal text still streams incrementally; only text following an
/// unresolved `<tool_call>` opening tag is held back.
struct TextModeToolCallFilter {
    upstream: ResponseStream,
    buf: String,
    next_index: u32,
    done: bool,
    pending: VecDeque<ResponseEvent>,
}

impl TextModeToolCallFilter {
    fn new(upstream: ResponseStream) -> Self {
        Self {
            upstream,
            buf: String::new(),
            next_index: 0,
            done: false,
            pending: VecDeque::new(),
        }
    }

    /// Extract every complete `<tool_call>...</tool_call>` block from `buf`,
    /// returning the synthesized events and the leftover plain text.
    fn drain_complete_blocks(&mut self) -> Vec<ResponseEvent> {
        let mut events = Vec::new();
        loop {
            let Some(open) = self.buf.find(TAG_OPEN) else {
                break;
            };
            let Some(close_rel) = self.buf[open + TAG_OPEN.len()..].find(TAG_CLOSE) else {
                // Incomplete block — keep everything from the opening tag
                // onward buffered, but flush the plain text before it.
                if open > 0 {
                    events.push(ResponseEvent::TextDelta(self.buf[..open].to_string()));
                    self.buf.drain(..open);
                }
                break;
            };
            let body_start = open + TAG_OPEN.len();
            let body_end = body_start + close_rel;
            if open > 0 {
                events.push(ResponseEvent::TextDelta(self.buf[..open].to_string()));
            }
            let body = self.buf[body_start..body_end].trim().to_string();
            events.push(self.parse_tool_call_body(&body));
            let consumed = body_end + TAG_CLOSE.len();
            self.buf.drain(..consumed);
        }
        events
    }

    fn parse_tool_call_body(&mut self, body: &str) -> ResponseEvent {
        let index = self.next_index;
        self.next_index += 1;
        match serde_json::from_str::<serde_json::Value>(body) {
            Ok(v) => {
                let name = v
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string();
                let arguments = v
                    .get("arguments")
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "{}".into());
                ResponseEvent::ToolCall {
                    index,
                    id: uuid::Uuid::new_v4().to_string(),
                    name,
                    arguments,
                }
            }
            Err(e) => {
                warn!(error = %e, body = %body, "model emitted unparsable <tool_call> text block");
                ResponseEvent::Error(format!("malformed tool_call block from model: {e}"))
            }
        }
    }

    /// Flush any remaining buffered text (called once the upstream is done
    /// and no closing tag ever arrived, or on plain trailing text).
    fn flush_remaining(&mut self) -> Option<ResponseEvent> {
        if self.buf.is_empty() {
            None
        } else {
            Some(ResponseEvent::TextDelta(std::mem::take(&mut self.buf)))
        }
    }
}

impl Stream for TextModeToolCallFilter {
    type Item = anyhow::Result<ResponseEvent>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;
        loop {
            if let Some(ev) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(ev)));
            }
            if self.done {
                return Poll::Ready(None);
            }
            match self.upstream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(ResponseEvent::TextDelta(delta)))) => {
                    self.buf.push_str(&delta);
                    let events = self.drain_complete_blocks();
                    self.pending.extend(events);
                    // loop back: either yield a pending event or poll again
                }
                Poll::Ready(Some(Ok(other))) => {
                    return Poll::Ready(Some(Ok(other)));
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if let Some(ev) = self.flush_remaining() {
                        return Poll::Ready(Some(Ok(ev)));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
