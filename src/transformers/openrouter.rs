//! OpenRouter request decoration
//!
//! Attaches OpenRouter-specific query extensions before dispatch: the
//! configured `cache_control` object and usage accounting so responses carry
//! token counts.

use super::Transformer;
use crate::models::openai::OpenAIRequest;
use std::collections::HashMap;
use tracing::debug;

/// OpenRouter cache-control transformer
pub struct OpenRouterTransformer {
    cache_control: Option<serde_json::Value>,
}

impl OpenRouterTransformer {
    pub fn new(options: &serde_json::Value) -> Self {
        Self {
            cache_control: options.get("cache_control").cloned(),
        }
    }
}

impl Transformer for OpenRouterTransformer {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn request_out(&self, mut request: OpenAIRequest) -> OpenAIRequest {
        let extra = request.extra_query.get_or_insert_with(HashMap::new);

        extra
            .entry("usage".to_string())
            .or_insert_with(|| serde_json::json!({"include": true}));

        if let Some(cache_control) = &self.cache_control {
            extra.insert("cache_control".to_string(), cache_control.clone());
            debug!("Attached OpenRouter cache_control");
        }

        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_control_attached() {
        let transformer = OpenRouterTransformer::new(&json!({
            "cache_control": {"ttl": 3600, "refresh": "force"}
        }));

        let out = transformer.request_out(OpenAIRequest::default());
        let extra = out.extra_query.unwrap();
        assert_eq!(extra["cache_control"]["ttl"], 3600);
        assert_eq!(extra["cache_control"]["refresh"], "force");
        assert_eq!(extra["usage"]["include"], true);
    }

    #[test]
    fn test_no_cache_control_configured() {
        let transformer = OpenRouterTransformer::new(&json!({}));
        let out = transformer.request_out(OpenAIRequest::default());

        let extra = out.extra_query.unwrap();
        assert!(!extra.contains_key("cache_control"));
        assert_eq!(extra["usage"]["include"], true);
    }

    #[test]
    fn test_existing_extra_query_preserved() {
        let transformer = OpenRouterTransformer::new(&json!({"cache_control": {"ttl": 60}}));

        let mut request = OpenAIRequest::default();
        let mut extra = HashMap::new();
        extra.insert("plugins".to_string(), json!([{"id": "web"}]));
        request.extra_query = Some(extra);

        let out = transformer.request_out(request);
        let extra = out.extra_query.unwrap();
        assert_eq!(extra["plugins"][0]["id"], "web");
        assert_eq!(extra["cache_control"]["ttl"], 60);
    }
}
