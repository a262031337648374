//! Transformer pipeline
//!
//! Pluggable mutators that patch provider-specific quirks at four hooks:
//! `request_in` (Claude request, before translation), `request_out` (OpenAI
//! request, before dispatch), `response_in` (raw OpenAI response or chunk)
//! and `response_out` (Claude response or event, before delivery).
//!
//! Transformers are registered in an explicit table keyed by name and
//! selected per `(provider, concrete_model)` by predicate matching; execution
//! order is configuration order.

pub mod deepseek;
pub mod openrouter;
pub mod tooluse;

use crate::config::TransformerConfig;
use crate::models::claude::{ClaudeRequest, ClaudeResponse, ClaudeStreamEvent};
use crate::models::openai::{OpenAIRequest, OpenAIResponse, OpenAIStreamChunk};
use std::sync::Arc;
use tracing::{debug, warn};

pub use deepseek::{DeepSeekTransformer, EXIT_TOOL_NAME};
pub use openrouter::OpenRouterTransformer;
pub use tooluse::ToolUseTransformer;

/// A request/response mutator. Hooks default to identity; implementations
/// override the ones they care about. Transformers must be deterministic and
/// must not touch anything outside the object they are given.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Before protocol translation
    fn request_in(&self, request: ClaudeRequest) -> ClaudeRequest {
        request
    }

    /// After translation, before dispatch
    fn request_out(&self, request: OpenAIRequest) -> OpenAIRequest {
        request
    }

    /// Raw upstream response, before reverse translation
    fn response_in(&self, response: OpenAIResponse) -> OpenAIResponse {
        response
    }

    /// Streaming variant of `response_in`, applied per chunk
    fn chunk_in(&self, chunk: OpenAIStreamChunk) -> OpenAIStreamChunk {
        chunk
    }

    /// Claude response, before delivery
    fn response_out(&self, response: ClaudeResponse) -> ClaudeResponse {
        response
    }

    /// Streaming variant of `response_out`, applied per emitted event
    fn event_out(&self, event: ClaudeStreamEvent) -> ClaudeStreamEvent {
        event
    }
}

/// A registered transformer with its resolved predicates
struct RegisteredTransformer {
    name: String,
    enabled: bool,
    providers: Vec<String>,
    models: Vec<String>,
    transformer: Arc<dyn Transformer>,
}

impl RegisteredTransformer {
    fn matches(&self, provider: &str, model: &str) -> bool {
        self.enabled
            && self.providers.iter().any(|p| glob_match(p, provider))
            && self.models.iter().any(|m| glob_match(m, model))
    }
}

/// The transformer table, built once from configuration
pub struct TransformerRegistry {
    entries: Vec<RegisteredTransformer>,
}

impl TransformerRegistry {
    /// Build the registry from `[transformers.<name>]` tables, preserving
    /// configuration order
    pub fn from_config(configs: &[TransformerConfig]) -> Self {
        let mut entries = Vec::new();

        for config in configs {
            let built: Option<(Arc<dyn Transformer>, &[&str])> = match config.name.as_str() {
                "deepseek" => Some((
                    Arc::new(DeepSeekTransformer::new(&config.options)),
                    &["deepseek"],
                )),
                "openrouter" => Some((
                    Arc::new(OpenRouterTransformer::new(&config.options)),
                    &["openrouter"],
                )),
                "tooluse" => Some((Arc::new(ToolUseTransformer), &["deepseek"])),
                other => {
                    warn!("Unknown transformer '{}' in configuration, skipping", other);
                    None
                }
            };

            if let Some((transformer, default_providers)) = built {
                let providers = if config.providers.is_empty() {
                    default_providers.iter().map(|s| s.to_string()).collect()
                } else {
                    config.providers.clone()
                };
                entries.push(RegisteredTransformer {
                    name: config.name.clone(),
                    enabled: config.enabled,
                    providers,
                    models: config.models.clone(),
                    transformer,
                });
            }
        }

        Self { entries }
    }

    /// Registry with no transformers
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Select the pipeline for one resolved `(provider, model)` pair
    pub fn pipeline_for(&self, provider: &str, model: &str) -> TransformerPipeline {
        let selected: Vec<Arc<dyn Transformer>> = self
            .entries
            .iter()
            .filter(|e| e.matches(provider, model))
            .inspect(|e| debug!("Transformer '{}' active for {}:{}", e.name, provider, model))
            .map(|e| e.transformer.clone())
            .collect();
        TransformerPipeline {
            transformers: selected,
        }
    }
}

/// The per-request chain of selected transformers
#[derive(Clone)]
pub struct TransformerPipeline {
    transformers: Vec<Arc<dyn Transformer>>,
}

impl TransformerPipeline {
    pub fn empty() -> Self {
        Self {
            transformers: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    pub fn request_in(&self, mut request: ClaudeRequest) -> ClaudeRequest {
        for t in &self.transformers {
            request = t.request_in(request);
        }
        request
    }

    pub fn request_out(&self, mut request: OpenAIRequest) -> OpenAIRequest {
        for t in &self.transformers {
            request = t.request_out(request);
        }
        request
    }

    pub fn response_in(&self, mut response: OpenAIResponse) -> OpenAIResponse {
        for t in &self.transformers {
            response = t.response_in(response);
        }
        response
    }

    pub fn chunk_in(&self, mut chunk: OpenAIStreamChunk) -> OpenAIStreamChunk {
        for t in &self.transformers {
            chunk = t.chunk_in(chunk);
        }
        chunk
    }

    pub fn response_out(&self, mut response: ClaudeResponse) -> ClaudeResponse {
        for t in &self.transformers {
            response = t.response_out(response);
        }
        response
    }

    pub fn event_out(&self, mut event: ClaudeStreamEvent) -> ClaudeStreamEvent {
        for t in &self.transformers {
            event = t.event_out(event);
        }
        event
    }
}

/// Case-insensitive glob match supporting `*` wildcards. A pattern without
/// wildcards is an exact match.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let value = value.to_lowercase();

    if !pattern.contains('*') {
        return pattern == value;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = value.as_str();

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            // Anchored prefix
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            // Anchored suffix
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }

    // Pattern ended with '*' (or consumed everything)
    segments.last().map(|s| s.is_empty()).unwrap_or(true) || rest.is_empty()
}
