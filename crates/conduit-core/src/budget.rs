// SPDX-License-Identifier: Apache-2.0
//! C9 — context budget manager.
//!
//! Deterministic, non-LLM elision: once the log crosses `trigger_fraction`
//! of the effective ceiling, the oldest atomic turn groups are dropped
//! (replaced by a one-line marker) until the log is back under budget or
//! only `keep_recent` groups remain. A turn group is a user message plus
//! every assistant/tool message up to (not including) the next user
//! message — dropping part of a group would leave a dangling tool_call_id
//! the provider would reject.
//!
//! Oversized individual tool results are capped independently, before
//! group elision is even considered, since one runaway tool output
//! shouldn't force the rest of the conversation out of the window.

use conduit_llm::{Message, MessageContent, Role, ToolResultContent};

use crate::error::{CoreError, Result};
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct BudgetPolicy {
    /// Provider context window, tokens.
    pub context_window: usize,
    /// Tokens held back for the next response and provider overhead.
    pub overhead_reserve: usize,
    /// Elision triggers once usage reaches this fraction of the effective ceiling.
    pub trigger_fraction: f32,
    /// Never elide the most recent `keep_recent` turn groups.
    pub keep_recent: usize,
    /// A single tool result is truncated down to this many tokens before
    /// group elision runs.
    pub tool_result_token_cap: usize,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            context_window: 128_000,
            overhead_reserve: 4_096,
            trigger_fraction: 0.85,
            keep_recent: 4,
            tool_result_token_cap: 4_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ElisionStats {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub groups_elided: usize,
}

impl BudgetPolicy {
    pub fn effective_ceiling(&self) -> usize {
        self.context_window.saturating_sub(self.overhead_reserve)
    }

    pub fn should_elide(&self, session: &Session) -> bool {
        let ceiling = self.effective_ceiling().max(1);
        (session.token_count as f32 / ceiling as f32) >= self.trigger_fraction
    }

    /// Cap any tool result message over `tool_result_token_cap`, replacing
    /// its content with a head/tail-truncated excerpt and a byte count.
    /// Runs before elision; mutates in place and recalculates token count.
    pub fn cap_oversized_tool_results(&self, session: &mut Session) {
        let mut changed = false;
        for msg in &mut session.messages {
            if let MessageContent::ToolResult { content, .. } = &mut msg.content {
                if let ToolResultContent::Text(text) = content {
                    let tokens = text.len() / 4;
                    if tokens > self.tool_result_token_cap {
                        *text = truncate_head_tail(text, self.tool_result_token_cap * 4);
                        changed = true;
                    }
                }
            }
        }
        if changed {
            session.recalculate_tokens();
        }
    }

    /// Elide oldest turn groups until under budget or only `keep_recent`
    /// remain. Returns `ContextOverflow` if the log is still over the
    /// ceiling after exhausting every eligible group.
    pub fn elide(&self, session: &mut Session) -> Result<ElisionStats> {
        let tokens_before = session.token_count;
        self.cap_oversized_tool_results(session);

        let groups = group_turns(&session.messages);
        let ceiling = self.effective_ceiling();

        let elidable_count = groups.len().saturating_sub(self.keep_recent);
        let mut kept: Vec<Message> = Vec::new();
        let mut groups_elided = 0;

        for (i, group) in groups.iter().enumerate() {
            let is_system = group.iter().all(|m| m.role == Role::System);
            let is_elidable = i < elidable_count && !is_system;
            if is_elidable && session_would_still_overflow(&kept, &groups[i + 1..], ceiling) {
                groups_elided += 1;
                kept.push(elision_marker(group));
            } else {
                kept.extend(group.iter().cloned());
            }
        }

        session.replace_messages(kept);
        let tokens_after = session.token_count;

        if tokens_after > ceiling && groups_elided >= elidable_count {
            return Err(CoreError::ContextOverflow { tokens: tokens_after, ceiling });
        }

        Ok(ElisionStats { tokens_before, tokens_after, groups_elided })
    }
}

/// Whether keeping everything from `remaining_groups` onward (plus what's
/// already in `kept`) would still exceed `ceiling` — used to stop eliding
/// as soon as the budget is satisfied rather than always dropping down to
/// `keep_recent`.
fn session_would_still_overflow(kept: &[Message], remaining_groups: &[Vec<Message>], ceiling: usize) -> bool {
    let kept_tokens: usize = kept.iter().map(Message::approx_tokens).sum();
    let remaining_tokens: usize = remaining_groups.iter().flatten().map(Message::approx_tokens).sum();
    kept_tokens + remaining_tokens > ceiling
}

fn elision_marker(group: &[Message]) -> Message {
    let tokens: usize = group.iter().map(Message::approx_tokens).sum();
    Message::system(format!("[{} earlier messages ({tokens} tokens) elided to stay within the context budget]", group.len()))
}

/// Split a message log into atomic turn groups: a user message plus every
/// following assistant/tool message, up to the next user message. Any
/// leading system messages form their own group and are never elided by
/// virtue of `is_system` in `elide`, but are still returned here so the
/// group index math stays consistent.
fn group_turns(messages: &[Message]) -> Vec<Vec<Message>> {
    let mut groups: Vec<Vec<Message>> = Vec::new();
    for msg in messages {
        if groups.is_empty() || msg.role == Role::User {
            groups.push(vec![msg.clone()]);
        } else {
            groups.last_mut().unwrap().push(msg.clone());
        }
    }
    groups
}

fn truncate_head_tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let half = max_bytes / 2;
    let head = safe_prefix(text, half);
    let tail = safe_suffix(text, half);
    format!("{head}\n… [{} bytes elided] …\n{tail}", text.len() - head.len() - tail.len())
}

fn safe_prefix(s: &str, n: usize) -> &str {
    let mut end = n.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn safe_suffix(s: &str, n: usize) -> &str {
    let mut start = s.len().saturating_sub(n);
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
