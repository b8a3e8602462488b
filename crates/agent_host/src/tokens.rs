//! Rough token estimate for display.
//!
//! Counts 4 characters per token; good enough to warn before a long
//! conversation outgrows a model's context window.

use shared::agent_api::ChatMessage;

const CHARS_PER_TOKEN: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Estimate for a whole request payload.
pub fn estimate_messages(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}
