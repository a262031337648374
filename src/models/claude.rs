//! Claude API data models
//!
//! Defines Claude API request, response and streaming event structures

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Claude messages request structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeRequest {
    /// Model name
    pub model: String,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Message list
    pub messages: Vec<ClaudeMessage>,
    /// System prompt: plain string or structured blocks (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    /// Tool definitions (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ClaudeTool>>,
    /// Tool choice directive (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ClaudeToolChoice>,
    /// Temperature parameter (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Top-p parameter (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Top-k parameter (optional, no OpenAI equivalent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Stop sequences (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Whether to stream the response (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Extended thinking configuration, passed through opaque (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<serde_json::Value>,
    /// Metadata (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// System prompt: a string or a list of text blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

/// Structured system block; `cache_control` survives only on native
/// Anthropic passthrough
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<serde_json::Value>,
}

impl SystemPrompt {
    /// Flatten to a single string, joining block texts with newlines
    pub fn flatten(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.block_type == "text")
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Claude message structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMessage {
    /// Role (user/assistant)
    pub role: String,
    /// Message content
    pub content: ClaudeContent,
}

/// Claude message content: plain text or typed blocks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaudeContent {
    Text(String),
    Blocks(Vec<ClaudeContentBlock>),
}

/// Claude content block, a tagged sum over the block types the wire knows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClaudeContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ClaudeImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

/// Claude image source: base64 payload or a direct URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeImageSource {
    /// Source type ("base64" or "url")
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Claude tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// Claude tool choice directive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClaudeToolChoice {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "tool")]
    Tool { name: String },
    #[serde(rename = "none")]
    None,
}

/// Claude API response (a `Message`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeResponse {
    /// Response ID
    pub id: String,
    /// Response type, always "message"
    #[serde(rename = "type")]
    pub response_type: String,
    /// Role, always "assistant"
    pub role: String,
    /// Response content blocks
    pub content: Vec<ClaudeContentBlock>,
    /// Model as claimed by the client
    pub model: String,
    /// Stop reason
    pub stop_reason: Option<String>,
    /// Stop sequence that fired, if any
    pub stop_sequence: Option<String>,
    /// Usage statistics
    pub usage: ClaudeUsage,
}

impl ClaudeResponse {
    /// Concatenated text of all text blocks
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ClaudeContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// All tool_use blocks in content order
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ClaudeContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// Claude usage statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaudeUsage {
    /// Input token count
    pub input_tokens: u32,
    /// Output token count
    pub output_tokens: u32,
    /// Tokens served from prompt cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
    /// Tokens written to prompt cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
}

/// Claude streaming event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClaudeStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: ClaudeStreamMessage },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: u32,
        content_block: ClaudeContentBlock,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta {
        index: u32,
        delta: ClaudeContentDelta,
    },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: u32 },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: ClaudeMessageDelta,
        usage: ClaudeUsage,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { error: ClaudeError },
}

impl ClaudeStreamEvent {
    /// SSE event name for this event
    pub fn event_name(&self) -> &'static str {
        match self {
            ClaudeStreamEvent::MessageStart { .. } => "message_start",
            ClaudeStreamEvent::ContentBlockStart { .. } => "content_block_start",
            ClaudeStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            ClaudeStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            ClaudeStreamEvent::MessageDelta { .. } => "message_delta",
            ClaudeStreamEvent::MessageStop => "message_stop",
            ClaudeStreamEvent::Ping => "ping",
            ClaudeStreamEvent::Error { .. } => "error",
        }
    }
}

/// Skeleton message carried by `message_start`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeStreamMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub role: String,
    pub content: Vec<serde_json::Value>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: ClaudeUsage,
}

/// Delta payload of a `content_block_delta`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClaudeContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

/// Delta payload of a `message_delta`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMessageDelta {
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
}

/// Claude error structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Claude error response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,
    pub error: ClaudeError,
}

/// Token counting request: same shape as a messages request minus the knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeTokenCountRequest {
    pub model: String,
    pub messages: Vec<ClaudeMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ClaudeTool>>,
}

impl ClaudeContent {
    /// Extract and concatenate text from all text blocks
    pub fn extract_text(&self) -> String {
        match self {
            ClaudeContent::Text(text) => text.clone(),
            ClaudeContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ClaudeContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Check if any block is a tool_result
    pub fn has_tool_results(&self) -> bool {
        match self {
            ClaudeContent::Text(_) => false,
            ClaudeContent::Blocks(blocks) => blocks
                .iter()
                .any(|block| matches!(block, ClaudeContentBlock::ToolResult { .. })),
        }
    }

    /// Check if any block is a tool_use
    pub fn has_tool_uses(&self) -> bool {
        match self {
            ClaudeContent::Text(_) => false,
            ClaudeContent::Blocks(blocks) => blocks
                .iter()
                .any(|block| matches!(block, ClaudeContentBlock::ToolUse { .. })),
        }
    }

    /// Check if any block is an image
    pub fn has_images(&self) -> bool {
        match self {
            ClaudeContent::Text(_) => false,
            ClaudeContent::Blocks(blocks) => blocks
                .iter()
                .any(|block| matches!(block, ClaudeContentBlock::Image { .. })),
        }
    }
}

impl Default for ClaudeRequest {
    fn default() -> Self {
        Self {
            model: "claude-3-5-sonnet-20241022".to_string(),
            max_tokens: 1024,
            messages: Vec::new(),
            system: None,
            tools: None,
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            stream: None,
            thinking: None,
            metadata: None,
        }
    }
}
