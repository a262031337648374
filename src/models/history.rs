//! History API data models
//!
//! Record and summary shapes returned by the history query surface

use serde::{Deserialize, Serialize};

/// One recorded exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Stable row id
    pub id: i64,
    /// Creation timestamp (ISO 8601)
    pub timestamp: String,
    /// Model the client asked for
    pub claimed_model: String,
    /// Model the request was actually served with
    pub concrete_model: String,
    /// Provider that served it
    pub provider: String,
    /// Full Claude request payload
    pub request: serde_json::Value,
    /// Translated OpenAI request, null on native Anthropic passthrough
    pub openai_request: serde_json::Value,
    /// Assembled Claude response (also for streaming)
    pub response: serde_json::Value,
    pub is_streaming: bool,
    /// pending / completed / partial / error
    pub status: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub request_length: u32,
    pub response_length: u32,
}

/// Paginated history listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub records: Vec<HistoryRecord>,
    pub total_count: usize,
    pub timestamp: String,
}

/// Aggregate usage for one concrete model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUsageSummary {
    pub model: String,
    pub request_count: u64,
    pub completed_requests: u64,
    pub partial_requests: u64,
    pub pending_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    /// completed / total, in percent
    pub success_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request: Option<String>,
}

/// Full usage summary response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummary {
    pub by_model: Vec<ModelUsageSummary>,
    pub timestamp: String,
}
