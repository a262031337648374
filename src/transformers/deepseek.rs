//! DeepSeek tool-use amplifier
//!
//! DeepSeek models drift away from calling tools over long conversations.
//! This transformer forces tool mode whenever tools are present: it sets
//! `tool_choice="required"`, injects a synthetic `ExitTool` escape hatch and
//! prepends a system reminder. Responses that call `ExitTool` are rewritten
//! back into plain text turns, and fenced JSON in text output is unwrapped.

use super::Transformer;
use crate::models::claude::{ClaudeContentBlock, ClaudeContentDelta, ClaudeResponse, ClaudeStreamEvent};
use crate::models::openai::*;
use crate::services::translator::parse_tool_arguments;
use tracing::{debug, warn};

pub const EXIT_TOOL_NAME: &str = "ExitTool";

const EXIT_TOOL_DESCRIPTION: &str = "Use this tool when you are in tool mode and have completed the task. \
This is the only valid way to exit tool mode.\n\
IMPORTANT: Before using this tool, ensure that none of the available tools are \
applicable to the current task. You must evaluate all available options; only \
if no suitable tool can help you complete the task should you use ExitTool to \
terminate tool mode.";

const TOOL_MODE_REMINDER: &str = "<system-reminder>Tool mode is active. The user expects you to proactively \
execute the most suitable tool to help complete the task.\n\
Before invoking a tool, you must carefully evaluate whether it matches the current task. \
If no available tool is appropriate for the task, you MUST call the `ExitTool` to exit \
tool mode; this is the only valid way to terminate tool mode.\n\
Always prioritize completing the user's task effectively and efficiently by \
using tools whenever appropriate.</system-reminder>";

/// DeepSeek forced-tool-mode transformer
pub struct DeepSeekTransformer {
    max_output: u32,
}

impl DeepSeekTransformer {
    pub fn new(options: &serde_json::Value) -> Self {
        Self {
            max_output: options
                .get("max_output")
                .and_then(|v| v.as_u64())
                .unwrap_or(8192) as u32,
        }
    }

    fn exit_tool() -> OpenAITool {
        OpenAITool {
            tool_type: "function".to_string(),
            function: OpenAIFunction {
                name: EXIT_TOOL_NAME.to_string(),
                description: Some(EXIT_TOOL_DESCRIPTION.to_string()),
                parameters: Some(serde_json::json!({
                    "type": "object",
                    "properties": {
                        "response": {
                            "type": "string",
                            "description": "Your response will be forwarded to the user exactly as returned; the tool will not modify or post-process it in any way."
                        }
                    },
                    "required": ["response"]
                })),
            },
        }
    }
}

impl Transformer for DeepSeekTransformer {
    fn name(&self) -> &'static str {
        "deepseek"
    }

    fn request_out(&self, mut request: OpenAIRequest) -> OpenAIRequest {
        if let Some(max_tokens) = request.max_tokens {
            if max_tokens > self.max_output {
                debug!(
                    "Clamping max_tokens from {} to {} for DeepSeek",
                    max_tokens, self.max_output
                );
                request.max_tokens = Some(self.max_output);
            }
        }

        let has_tools = request.tools.as_ref().map(|t| !t.is_empty()).unwrap_or(false);
        if !has_tools {
            return request;
        }

        request.tool_choice = Some(serde_json::json!("required"));

        let tools = request.tools.as_mut().unwrap();
        let exit_exists = tools.iter().any(|t| t.function.name == EXIT_TOOL_NAME);
        if !exit_exists {
            tools.push(Self::exit_tool());
        }

        request
            .messages
            .insert(0, OpenAIMessage::text("system", TOOL_MODE_REMINDER));

        request
    }

    fn response_in(&self, mut response: OpenAIResponse) -> OpenAIResponse {
        let Some(choice) = response.choices.first_mut() else {
            return response;
        };

        let is_exit = choice
            .message
            .tool_calls
            .as_ref()
            .and_then(|calls| calls.first())
            .map(|call| call.function.name == EXIT_TOOL_NAME)
            .unwrap_or(false);
        if !is_exit {
            return response;
        }

        let call = &choice.message.tool_calls.as_ref().unwrap()[0];
        let arguments = parse_tool_arguments(&call.function.arguments);
        match arguments.get("response").and_then(|r| r.as_str()) {
            Some(text) => {
                choice.message.content = Some(OpenAIContent::Text(text.to_string()));
                choice.message.tool_calls = None;
                choice.finish_reason = Some("stop".to_string());
            }
            None => warn!("ExitTool call without a usable response argument"),
        }

        response
    }

    fn chunk_in(&self, mut chunk: OpenAIStreamChunk) -> OpenAIStreamChunk {
        let Some(choice) = chunk.choices.first_mut() else {
            return chunk;
        };

        // Only a chunk carrying the complete ExitTool arguments can be
        // rewritten statelessly
        let rewrite = choice.delta.tool_calls.as_ref().and_then(|calls| {
            calls.iter().find_map(|call| {
                if call.function.name.as_deref() != Some(EXIT_TOOL_NAME) {
                    return None;
                }
                let args = call.function.arguments.as_deref()?;
                let parsed: serde_json::Value = serde_json::from_str(args).ok()?;
                parsed
                    .get("response")
                    .and_then(|r| r.as_str())
                    .map(String::from)
            })
        });

        if let Some(text) = rewrite {
            choice.delta.content = Some(text);
            choice.delta.tool_calls = None;
            if choice.finish_reason.is_some() {
                choice.finish_reason = Some("stop".to_string());
            }
        }

        chunk
    }

    fn response_out(&self, mut response: ClaudeResponse) -> ClaudeResponse {
        for block in &mut response.content {
            if let ClaudeContentBlock::Text { text } = block {
                if let Some(json) = extract_fenced_json(text) {
                    *text = json;
                }
            }
        }
        response
    }

    fn event_out(&self, mut event: ClaudeStreamEvent) -> ClaudeStreamEvent {
        if let ClaudeStreamEvent::ContentBlockDelta {
            delta: ClaudeContentDelta::TextDelta { text },
            ..
        } = &mut event
        {
            if let Some(json) = extract_fenced_json(text) {
                *text = json;
            }
        }
        event
    }
}

/// Extract the body of a fenced ```json code block when it parses as JSON
pub fn extract_fenced_json(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let mut body = &text[start + 3..];
    if let Some(stripped) = body.strip_prefix("json") {
        body = stripped;
    }
    let end = body.find("```")?;
    let candidate = body[..end].trim();

    if candidate.is_empty() {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(candidate).ok()?;
    Some(candidate.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transformer() -> DeepSeekTransformer {
        DeepSeekTransformer::new(&json!({}))
    }

    fn request_with_tools() -> OpenAIRequest {
        OpenAIRequest {
            model: "deepseek-chat".to_string(),
            messages: vec![OpenAIMessage::text("user", "Weather in Paris?")],
            max_tokens: Some(4096),
            tools: Some(vec![OpenAITool {
                tool_type: "function".to_string(),
                function: OpenAIFunction {
                    name: "get_weather".to_string(),
                    description: None,
                    parameters: Some(json!({"type": "object"})),
                },
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_forced_tool_mode() {
        let out = transformer().request_out(request_with_tools());

        assert_eq!(out.tool_choice, Some(json!("required")));

        let tools = out.tools.unwrap();
        assert!(tools.iter().any(|t| t.function.name == EXIT_TOOL_NAME));
        assert!(tools.iter().any(|t| t.function.name == "get_weather"));

        // Reminder is prepended as the first message
        assert_eq!(out.messages[0].role, "system");
        assert!(out.messages[0]
            .content
            .as_ref()
            .unwrap()
            .extract_text()
            .contains("ExitTool"));
    }

    #[test]
    fn test_no_tools_untouched() {
        let request = OpenAIRequest {
            model: "deepseek-chat".to_string(),
            messages: vec![OpenAIMessage::text("user", "hi")],
            ..Default::default()
        };
        let out = transformer().request_out(request);
        assert!(out.tool_choice.is_none());
        assert!(out.tools.is_none());
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn test_exit_tool_not_duplicated() {
        let mut request = request_with_tools();
        request
            .tools
            .as_mut()
            .unwrap()
            .push(DeepSeekTransformer::exit_tool());

        let out = transformer().request_out(request);
        let exits = out
            .tools
            .unwrap()
            .iter()
            .filter(|t| t.function.name == EXIT_TOOL_NAME)
            .count();
        assert_eq!(exits, 1);
    }

    #[test]
    fn test_max_tokens_clamped() {
        let t = DeepSeekTransformer::new(&json!({"max_output": 2048}));
        let mut request = request_with_tools();
        request.max_tokens = Some(16384);

        let out = t.request_out(request);
        assert_eq!(out.max_tokens, Some(2048));
    }

    #[test]
    fn test_exit_tool_response_rewritten() {
        let response = OpenAIResponse {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion".to_string(),
            created: 1700000000,
            model: "deepseek-chat".to_string(),
            choices: vec![OpenAIChoice {
                index: 0,
                message: OpenAIMessage {
                    role: "assistant".to_string(),
                    content: None,
                    tool_calls: Some(vec![OpenAIToolCall {
                        id: "call_1".to_string(),
                        tool_type: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: EXIT_TOOL_NAME.to_string(),
                            arguments: r#"{"response": "no tool needed"}"#.to_string(),
                        },
                    }]),
                    tool_call_id: None,
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
            usage: None,
        };

        let out = transformer().response_in(response);
        let choice = &out.choices[0];
        assert!(choice.message.tool_calls.is_none());
        assert_eq!(
            choice.message.content.as_ref().map(|c| c.extract_text()),
            Some("no tool needed".to_string())
        );
        assert_eq!(choice.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_domain_tool_call_untouched() {
        let response = OpenAIResponse {
            id: "chatcmpl-2".to_string(),
            object: "chat.completion".to_string(),
            created: 1700000000,
            model: "deepseek-chat".to_string(),
            choices: vec![OpenAIChoice {
                index: 0,
                message: OpenAIMessage {
                    role: "assistant".to_string(),
                    content: None,
                    tool_calls: Some(vec![OpenAIToolCall {
                        id: "call_1".to_string(),
                        tool_type: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: "get_weather".to_string(),
                            arguments: r#"{"city": "Paris"}"#.to_string(),
                        },
                    }]),
                    tool_call_id: None,
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
            usage: None,
        };

        let out = transformer().response_in(response);
        assert!(out.choices[0].message.tool_calls.is_some());
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("tool_calls"));
    }

    #[test]
    fn test_exit_tool_chunk_rewritten() {
        let chunk = OpenAIStreamChunk {
            id: "chatcmpl-3".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 1700000000,
            model: "deepseek-chat".to_string(),
            choices: vec![OpenAIStreamChoice {
                index: 0,
                delta: OpenAIStreamDelta {
                    role: None,
                    content: None,
                    tool_calls: Some(vec![OpenAIToolCallDelta {
                        index: 0,
                        id: Some("call_1".to_string()),
                        tool_type: Some("function".to_string()),
                        function: OpenAIFunctionCallDelta {
                            name: Some(EXIT_TOOL_NAME.to_string()),
                            arguments: Some(r#"{"response": "done here"}"#.to_string()),
                        },
                    }]),
                },
                finish_reason: Some("tool_calls".to_string()),
            }],
            usage: None,
        };

        let out = transformer().chunk_in(chunk);
        let choice = &out.choices[0];
        assert_eq!(choice.delta.content.as_deref(), Some("done here"));
        assert!(choice.delta.tool_calls.is_none());
        assert_eq!(choice.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_fenced_json_extraction() {
        assert_eq!(
            extract_fenced_json("```json\n{\"a\": 1}\n```"),
            Some("{\"a\": 1}".to_string())
        );
        assert_eq!(
            extract_fenced_json("prefix ```\n[1, 2]\n``` suffix"),
            Some("[1, 2]".to_string())
        );
        // Not JSON inside the fence
        assert_eq!(extract_fenced_json("```json\nnot json at all{\n```"), None);
        // No fence
        assert_eq!(extract_fenced_json("{\"a\": 1}"), None);
        // Unterminated fence
        assert_eq!(extract_fenced_json("```json\n{\"a\": 1}"), None);
    }

    #[test]
    fn test_response_out_unwraps_fenced_json() {
        let response = ClaudeResponse {
            id: "msg_1".to_string(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: vec![ClaudeContentBlock::Text {
                text: "```json\n{\"result\": 42}\n```".to_string(),
            }],
            model: "claude-3-opus".to_string(),
            stop_reason: Some("end_turn".to_string()),
            stop_sequence: None,
            usage: Default::default(),
        };

        let out = transformer().response_out(response);
        assert_eq!(out.text(), "{\"result\": 42}");
    }
}
