//! Protocol translator
//!
//! Converts Claude messages requests into OpenAI chat-completion requests and
//! OpenAI responses back into Claude messages.

use crate::config::ServerSettings;
use crate::models::{claude::*, openai::*};
use crate::utils::error::{AppError, AppResult};
use crate::utils::token_count::estimate_tokens;
use tracing::{debug, warn};
use uuid::Uuid;

/// Request/response translator
#[derive(Debug, Clone)]
pub struct Translator {
    max_tokens_limit: u32,
    min_tokens_limit: u32,
}

impl Translator {
    pub fn new(server: &ServerSettings) -> Self {
        Self {
            max_tokens_limit: server.max_tokens_limit,
            min_tokens_limit: server.min_tokens_limit,
        }
    }

    /// Convert a Claude request into OpenAI chat-completions shape
    pub fn convert_request(
        &self,
        claude_req: &ClaudeRequest,
        concrete_model: &str,
    ) -> AppResult<OpenAIRequest> {
        debug!("Converting Claude request for model {}", concrete_model);

        let mut messages = Vec::new();

        // Leading system message; cache_control annotations are dropped here,
        // native Anthropic passthrough keeps the original body instead
        if let Some(system) = &claude_req.system {
            let text = system.flatten();
            if !text.trim().is_empty() {
                messages.push(OpenAIMessage::text("system", text.trim()));
            }
        }

        for msg in &claude_req.messages {
            match msg.role.as_str() {
                "user" => {
                    if msg.content.has_tool_results() {
                        messages.extend(self.split_tool_result_message(msg));
                    } else {
                        messages.push(self.convert_user_message(msg));
                    }
                }
                "assistant" => messages.push(self.convert_assistant_message(msg)),
                other => {
                    return Err(AppError::InvalidRequest(format!(
                        "unsupported message role '{}'",
                        other
                    )))
                }
            }
        }

        let mut openai_req = OpenAIRequest {
            model: concrete_model.to_string(),
            messages,
            max_tokens: Some(
                claude_req
                    .max_tokens
                    .max(self.min_tokens_limit)
                    .min(self.max_tokens_limit),
            ),
            temperature: claude_req.temperature,
            top_p: claude_req.top_p,
            stop: claude_req.stop_sequences.clone(),
            stream: claude_req.stream,
            ..Default::default()
        };
        // top_k has no OpenAI equivalent and is dropped

        if let Some(tools) = &claude_req.tools {
            let openai_tools: Vec<OpenAITool> = tools
                .iter()
                .filter(|t| !t.name.trim().is_empty())
                .map(|t| OpenAITool {
                    tool_type: "function".to_string(),
                    function: OpenAIFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: Some(t.input_schema.clone()),
                    },
                })
                .collect();
            if !openai_tools.is_empty() {
                openai_req.tools = Some(openai_tools);
            }
        }

        if let Some(choice) = &claude_req.tool_choice {
            openai_req.tool_choice = Some(match choice {
                ClaudeToolChoice::Auto => serde_json::json!("auto"),
                ClaudeToolChoice::Any => serde_json::json!("required"),
                ClaudeToolChoice::Tool { name } => serde_json::json!({
                    "type": "function",
                    "function": {"name": name}
                }),
                ClaudeToolChoice::None => serde_json::json!("none"),
            });
        }

        Ok(openai_req)
    }

    /// Convert a plain user message (text and images, no tool results)
    fn convert_user_message(&self, msg: &ClaudeMessage) -> OpenAIMessage {
        match &msg.content {
            ClaudeContent::Text(text) => OpenAIMessage::text("user", text.clone()),
            ClaudeContent::Blocks(blocks) => {
                let parts = self.blocks_to_parts(blocks);
                self.user_message_from_parts(parts)
            }
        }
    }

    /// Text and image blocks to OpenAI multimodal parts
    fn blocks_to_parts(&self, blocks: &[ClaudeContentBlock]) -> Vec<OpenAIContentPart> {
        let mut parts = Vec::new();
        for block in blocks {
            match block {
                ClaudeContentBlock::Text { text } => {
                    parts.push(OpenAIContentPart::Text { text: text.clone() });
                }
                ClaudeContentBlock::Image { source } => {
                    if let Some(url) = image_source_url(source) {
                        parts.push(OpenAIContentPart::ImageUrl {
                            image_url: OpenAIImageUrl { url, detail: None },
                        });
                    } else {
                        warn!("Skipping image block with unusable source");
                    }
                }
                _ => {}
            }
        }
        parts
    }

    /// Collapse a single text part to string content, keep parts otherwise
    fn user_message_from_parts(&self, parts: Vec<OpenAIContentPart>) -> OpenAIMessage {
        let content = match parts.len() {
            0 => Some(OpenAIContent::Text(String::new())),
            1 => match parts.into_iter().next().unwrap() {
                OpenAIContentPart::Text { text } => Some(OpenAIContent::Text(text)),
                part => Some(OpenAIContent::Parts(vec![part])),
            },
            _ => Some(OpenAIContent::Parts(parts)),
        };
        OpenAIMessage {
            role: "user".to_string(),
            content,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Split a user message carrying tool results: the remaining text/image
    /// blocks form a single user message, followed by one role="tool" message
    /// per result
    fn split_tool_result_message(&self, msg: &ClaudeMessage) -> Vec<OpenAIMessage> {
        let blocks = match &msg.content {
            ClaudeContent::Blocks(blocks) => blocks,
            ClaudeContent::Text(text) => {
                return vec![OpenAIMessage::text("user", text.clone())];
            }
        };

        let mut messages = Vec::new();

        let carried: Vec<ClaudeContentBlock> = blocks
            .iter()
            .filter(|b| {
                matches!(
                    b,
                    ClaudeContentBlock::Text { .. } | ClaudeContentBlock::Image { .. }
                )
            })
            .cloned()
            .collect();
        if !carried.is_empty() {
            let parts = self.blocks_to_parts(&carried);
            messages.push(self.user_message_from_parts(parts));
        }

        for block in blocks {
            if let ClaudeContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } = block
            {
                messages.push(OpenAIMessage {
                    role: "tool".to_string(),
                    content: Some(OpenAIContent::Text(flatten_tool_result(content.as_ref()))),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
        }

        messages
    }

    /// Convert an assistant message, folding tool_use blocks into tool_calls
    fn convert_assistant_message(&self, msg: &ClaudeMessage) -> OpenAIMessage {
        let blocks = match &msg.content {
            ClaudeContent::Text(text) => {
                return OpenAIMessage::text("assistant", text.clone());
            }
            ClaudeContent::Blocks(blocks) => blocks,
        };

        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();

        for block in blocks {
            match block {
                ClaudeContentBlock::Text { text } => text_parts.push(text.as_str()),
                ClaudeContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(OpenAIToolCall {
                        id: id.clone(),
                        tool_type: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: name.clone(),
                            arguments: input.to_string(),
                        },
                    });
                }
                // Thinking blocks are an Anthropic-side concept
                _ => {}
            }
        }

        OpenAIMessage {
            role: "assistant".to_string(),
            content: if text_parts.is_empty() {
                None
            } else {
                Some(OpenAIContent::Text(text_parts.concat()))
            },
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
        }
    }

    /// Convert an OpenAI response into a Claude `Message`.
    ///
    /// `fallback_input_tokens` is the request-side estimate used when the
    /// upstream omits usage, keeping `total = input + output` intact.
    pub fn convert_response(
        &self,
        openai_resp: OpenAIResponse,
        original_model: &str,
        fallback_input_tokens: u32,
    ) -> AppResult<ClaudeResponse> {
        let choice = openai_resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::UpstreamProtocol("no choices in response".to_string()))?;

        let mut content = Vec::new();

        if let Some(text) = choice.message.content.as_ref().map(|c| c.extract_text()) {
            if !text.is_empty() {
                content.push(ClaudeContentBlock::Text { text });
            }
        }

        for tool_call in choice.message.tool_calls.unwrap_or_default() {
            let input = parse_tool_arguments(&tool_call.function.arguments);
            content.push(ClaudeContentBlock::ToolUse {
                id: tool_call.id,
                name: tool_call.function.name,
                input,
            });
        }

        if content.is_empty() {
            content.push(ClaudeContentBlock::Text {
                text: String::new(),
            });
        }

        let stop_reason = map_finish_reason(choice.finish_reason.as_deref());

        let usage = claude_usage_from(openai_resp.usage.as_ref(), || {
            let output = content
                .iter()
                .map(|block| match block {
                    ClaudeContentBlock::Text { text } => estimate_tokens(text),
                    ClaudeContentBlock::ToolUse { input, .. } => {
                        estimate_tokens(&input.to_string())
                    }
                    _ => 0,
                })
                .sum();
            (fallback_input_tokens, output)
        });

        Ok(ClaudeResponse {
            id: new_message_id(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: original_model.to_string(),
            stop_reason: Some(stop_reason),
            stop_sequence: None,
            usage,
        })
    }
}

/// Generate a fresh Claude-style message id
pub fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// Map an OpenAI finish_reason to a Claude stop_reason
pub fn map_finish_reason(finish_reason: Option<&str>) -> String {
    match finish_reason {
        Some("stop") => "end_turn".to_string(),
        Some("length") => "max_tokens".to_string(),
        Some("tool_calls") | Some("function_call") => "tool_use".to_string(),
        Some("content_filter") => {
            warn!("Upstream reported a content filter stop");
            "end_turn".to_string()
        }
        Some(other) => {
            warn!("Unknown finish_reason: {}", other);
            "end_turn".to_string()
        }
        None => "end_turn".to_string(),
    }
}

/// Parse tool-call arguments; unparseable payloads survive under `_raw`
pub fn parse_tool_arguments(arguments: &str) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::json!({});
    }
    match serde_json::from_str(arguments) {
        Ok(value) => value,
        Err(e) => {
            warn!("Tool arguments are not valid JSON: {}", e);
            serde_json::json!({ "_raw": arguments })
        }
    }
}

/// Build Claude usage from upstream usage, falling back to an estimate
pub fn claude_usage_from<F>(usage: Option<&OpenAIUsage>, estimate: F) -> ClaudeUsage
where
    F: FnOnce() -> (u32, u32),
{
    match usage {
        Some(u) if u.prompt_tokens > 0 || u.completion_tokens > 0 => ClaudeUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            cache_read_input_tokens: u
                .prompt_tokens_details
                .as_ref()
                .map(|d| d.cached_tokens),
            cache_creation_input_tokens: None,
        },
        _ => {
            let (input, output) = estimate();
            ClaudeUsage {
                input_tokens: input,
                output_tokens: output,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            }
        }
    }
}

/// Flatten Claude tool-result content into the string OpenAI expects
fn flatten_tool_result(content: Option<&serde_json::Value>) -> String {
    let Some(content) = content else {
        return "No content provided".to_string();
    };

    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => {
            let mut parts = Vec::new();
            for item in items {
                match item {
                    serde_json::Value::String(s) => parts.push(s.clone()),
                    serde_json::Value::Object(obj) => {
                        if let Some(serde_json::Value::String(text)) = obj.get("text") {
                            parts.push(text.clone());
                        } else {
                            parts.push(item.to_string());
                        }
                    }
                    other => parts.push(other.to_string()),
                }
            }
            parts.join("\n").trim().to_string()
        }
        serde_json::Value::Object(obj) => {
            if let Some(serde_json::Value::String(text)) = obj.get("text") {
                text.clone()
            } else {
                content.to_string()
            }
        }
        other => other.to_string(),
    }
}

/// Data URI or direct URL for an image source
fn image_source_url(source: &ClaudeImageSource) -> Option<String> {
    match source.source_type.as_str() {
        "base64" => {
            let media_type = source.media_type.as_deref()?;
            let data = source.data.as_deref()?;
            Some(format!("data:{};base64,{}", media_type, data))
        }
        "url" => source.url.clone(),
        _ => None,
    }
}
