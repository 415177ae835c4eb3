// SPDX-License-Identifier: Apache-2.0
//! The message log: the single growing value the orchestration loop reads
//! and writes every turn, with a running approximate-token count so C9 can
//! decide when to act without re-walking the whole history each time.

use conduit_llm::Message;
use uuid::Uuid;

/// The in-memory conversation log for one query/chat/workflow run.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Running sum of `Message::approx_tokens()` over `messages`.
    pub token_count: usize,
    /// Ceiling used by `context_fraction`/`is_near_limit`; set from the
    /// provider's context window minus the configured overhead reserve.
    pub max_tokens: usize,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self { id: Uuid::new_v4().to_string(), messages: Vec::new(), token_count: 0, max_tokens }
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs {
            self.push(m);
        }
    }

    /// Fraction of the context window consumed, in `[0.0, 1.0]` (can exceed
    /// 1.0 if messages were pushed past the ceiling without compaction).
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recompute `token_count` from scratch. Call after any operation that
    /// mutates `messages` directly, such as elision (C9).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(Message::approx_tokens).sum();
    }

    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }
}
