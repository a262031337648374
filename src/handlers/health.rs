//! Health check handler

use crate::handlers::AppState;
use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    /// At least one OpenAI-compatible provider is configured
    pub openai_api_configured: bool,
    /// Every configured provider resolves to a non-empty key
    pub api_key_valid: bool,
    /// Whether inbound requests are checked against a shared secret
    pub client_api_key_validation: bool,
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    debug!("Health check");

    let providers = &state.settings.providers;

    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        openai_api_configured: providers.iter().any(|p| !p.is_anthropic()),
        api_key_valid: providers.iter().all(|p| !p.resolve_api_key().is_empty()),
        client_api_key_validation: state.settings.server.client_api_key.is_some(),
    })
}
