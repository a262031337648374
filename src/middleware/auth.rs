//! Client authentication
//!
//! Validates the shared secret on the messages endpoints. The secret arrives
//! in `x-api-key` or as an `Authorization: Bearer` token; when no secret is
//! configured, any caller is accepted.

use crate::handlers::AppState;
use crate::utils::error::AppError;
use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Axum middleware enforcing the shared secret
pub async fn require_client_secret(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.settings.server.client_api_key.as_deref() else {
        return Ok(next.run(request).await);
    };

    match extract_client_token(request.headers()) {
        Some(token) if token == expected => {
            debug!("Client secret accepted");
            Ok(next.run(request).await)
        }
        Some(_) => {
            warn!("Client presented an invalid API key");
            Err(AppError::Unauthorized("invalid API key".to_string()))
        }
        None => {
            warn!("Client request without an API key");
            Err(AppError::Unauthorized("missing API key".to_string()))
        }
    }
}

/// Client token from `x-api-key` or `Authorization: Bearer ...`
pub fn extract_client_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
}
