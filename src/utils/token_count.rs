//! Character-based token estimation
//!
//! Fallback accounting for upstreams that omit usage data. The ratio is an
//! approximation (about four characters per token for English text); exact
//! counts always come from upstream usage when present.

use crate::models::claude::{ClaudeContent, ClaudeMessage, SystemPrompt};

/// Estimate tokens in a text: collapse whitespace runs, then ceil(chars / 4),
/// never less than 1 for non-empty input
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let mut chars = 0usize;
    let mut in_whitespace = false;
    for c in text.trim().chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                chars += 1;
            }
            in_whitespace = true;
        } else {
            chars += 1;
            in_whitespace = false;
        }
    }

    std::cmp::max(1, (chars as u32).div_ceil(4))
}

/// Estimate input tokens for a request: system prompt plus all message text
pub fn estimate_input_tokens(system: Option<&SystemPrompt>, messages: &[ClaudeMessage]) -> u32 {
    let mut text = String::new();

    if let Some(system) = system {
        text.push_str(&system.flatten());
        text.push(' ');
    }

    for msg in messages {
        match &msg.content {
            ClaudeContent::Text(t) => {
                text.push_str(t);
                text.push(' ');
            }
            ClaudeContent::Blocks(_) => {
                text.push_str(&msg.content.extract_text());
                text.push(' ');
            }
        }
    }

    estimate_tokens(&text)
}
