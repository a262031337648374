//! Generic tool-use reminder
//!
//! Appends a one-line system reminder encouraging tool use whenever the
//! request carries tools. Milder than the DeepSeek amplifier: no forced
//! tool_choice, no synthetic tools.

use super::Transformer;
use crate::models::openai::{OpenAIMessage, OpenAIRequest};

const REMINDER: &str = "<system-reminder>Tools are available for this task; prefer invoking the most suitable tool over answering from memory.</system-reminder>";

/// Tool-use reminder transformer
pub struct ToolUseTransformer;

impl Transformer for ToolUseTransformer {
    fn name(&self) -> &'static str {
        "tooluse"
    }

    fn request_out(&self, mut request: OpenAIRequest) -> OpenAIRequest {
        let has_tools = request.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false);
        if has_tools {
            request.messages.push(OpenAIMessage::text("system", REMINDER));
        }
        request
    }
}
