//! Error handling module
//!
//! Typed error taxonomy with HTTP status and Claude error body mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed request: schema violation, missing max_tokens, unknown tool
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Shared-secret mismatch
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Selection references a model no provider advertises
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// No provider advertises the requested tier
    #[error("No provider available: {0}")]
    NoProvider(String),

    /// Resource lookup miss (history records and the like)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upstream call exceeded the request timeout
    #[error("Upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// Connect or TLS failure talking to the upstream
    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    /// Upstream sent a chunk we could not parse
    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// Upstream rejected our credentials; masked so the provider key setup
    /// is not exposed to clients
    #[error("Upstream authentication failed")]
    UpstreamAuth,

    /// Upstream returned 429
    #[error("Upstream rate limited: {0}")]
    UpstreamRateLimited(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Claude API error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ClaudeErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub error: ClaudeErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClaudeErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl AppError {
    /// HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::UnknownModel(_) | AppError::NoProvider(_) | AppError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            AppError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::UpstreamTransport(_)
            | AppError::UpstreamProtocol(_)
            | AppError::UpstreamAuth => StatusCode::BAD_GATEWAY,
            AppError::UpstreamRateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Claude error type string for this error
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "invalid_request_error",
            AppError::Unauthorized(_) => "authentication_error",
            AppError::UnknownModel(_) | AppError::NoProvider(_) | AppError::NotFound(_) => {
                "not_found_error"
            }
            AppError::UpstreamTimeout(_) => "timeout_error",
            AppError::UpstreamRateLimited(_) => "rate_limit_error",
            AppError::UpstreamTransport(_)
            | AppError::UpstreamProtocol(_)
            | AppError::UpstreamAuth
            | AppError::Internal(_) => "api_error",
        }
    }

    /// Message safe to persist and return to the client
    pub fn sanitized_message(&self) -> String {
        match self {
            // Upstream auth details never leave the proxy
            AppError::UpstreamAuth => "Upstream provider rejected the request".to_string(),
            other => other.to_string(),
        }
    }

    /// Convert to the Claude error body
    pub fn to_claude_error(&self) -> ClaudeErrorBody {
        ClaudeErrorBody {
            error_type: "error".to_string(),
            error: ClaudeErrorDetail {
                error_type: self.error_type().to_string(),
                message: self.sanitized_message(),
            },
        }
    }

    /// Whether a failed upstream attempt with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::UpstreamTimeout(_)
                | AppError::UpstreamTransport(_)
                | AppError::UpstreamRateLimited(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            AppError::Unauthorized(_) => {
                tracing::warn!("Client error: {} - status {}", self.error_type(), status)
            }
            _ => tracing::error!("Request failed: {} - status {}", self, status),
        }

        (status, Json(self.to_claude_error())).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("Serialization failed: {}", err))
    }
}

/// Result type alias
pub type AppResult<T> = Result<T, AppError>;
