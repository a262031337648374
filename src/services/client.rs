//! Upstream HTTP clients
//!
//! Two dispatch modes: OpenAI-compatible chat-completions (with translation)
//! and native Anthropic passthrough. Both support buffered and streaming
//! calls. Connect and timeout failures are retried within a configurable
//! budget; nothing is retried once the first streamed byte has arrived.

use crate::config::{ProviderConfig, ServerSettings};
use crate::models::openai::{OpenAIErrorResponse, OpenAIRequest, OpenAIResponse, OpenAIStreamChunk};
use crate::utils::error::{AppError, AppResult};
use reqwest::{Client, Response, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Upstream client with separate buffered and streaming timeouts
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    stream_client: Client,
    max_retries: u32,
}

impl UpstreamClient {
    pub fn new(server: &ServerSettings) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = Client::builder()
            .timeout(Duration::from_secs(server.request_timeout))
            .user_agent(concat!("ccproxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        let stream_client = Client::builder()
            .timeout(Duration::from_secs(server.stream_timeout))
            .user_agent(concat!("ccproxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create streaming HTTP client")?;

        Ok(Self {
            client,
            stream_client,
            max_retries: server.max_retries,
        })
    }

    /// Buffered OpenAI-compatible chat completion with retry budget
    pub async fn chat_completion(
        &self,
        provider: &ProviderConfig,
        request: &OpenAIRequest,
    ) -> AppResult<OpenAIResponse> {
        let url = chat_completions_url(provider);
        // extra_query rides on the URL, not in the body
        let mut body = request.clone();
        let query = body.extra_query.take().map(|extra| query_pairs(&extra));
        let mut last_error: Option<AppError> = None;
        let mut retried_rate_limit = false;

        for attempt in 0..=self.max_retries {
            let mut builder = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", provider.resolve_api_key()))
                .header("Content-Type", "application/json");
            if let Some(query) = &query {
                builder = builder.query(query);
            }
            let result = builder.json(&body).send().await;

            let error = match result {
                Ok(response) if response.status().is_success() => {
                    return response.json::<OpenAIResponse>().await.map_err(|e| {
                        AppError::UpstreamProtocol(format!("invalid response body: {}", e))
                    });
                }
                Ok(response) => {
                    let retry_after = parse_retry_after(&response);
                    let err = error_from_status(response).await;

                    // A 429 honors Retry-After exactly once
                    if matches!(err, AppError::UpstreamRateLimited(_)) {
                        if retried_rate_limit {
                            return Err(err);
                        }
                        retried_rate_limit = true;
                        if let Some(delay) = retry_after {
                            tokio::time::sleep(delay.min(Duration::from_secs(10))).await;
                        }
                    }
                    err
                }
                Err(e) => error_from_reqwest(e),
            };

            if !error.is_retryable() || attempt == self.max_retries {
                return Err(error);
            }

            warn!(
                "Upstream attempt {}/{} failed, retrying: {}",
                attempt + 1,
                self.max_retries,
                error
            );
            last_error = Some(error);
            tokio::time::sleep(Duration::from_millis(250 * (attempt as u64 + 1))).await;
        }

        Err(last_error.unwrap_or_else(|| AppError::Internal("retry loop exhausted".to_string())))
    }

    /// Streaming OpenAI-compatible chat completion. Parsed chunks arrive on
    /// the returned stream until `[DONE]`; a malformed frame terminates the
    /// stream with `UpstreamProtocol`.
    pub async fn chat_completion_stream(
        &self,
        provider: &ProviderConfig,
        request: &OpenAIRequest,
    ) -> AppResult<ReceiverStream<AppResult<OpenAIStreamChunk>>> {
        let url = chat_completions_url(provider);
        let mut body = request.clone();
        let query = body.extra_query.take().map(|extra| query_pairs(&extra));

        let mut builder = self
            .stream_client
            .post(&url)
            .header("Authorization", format!("Bearer {}", provider.resolve_api_key()))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream");
        if let Some(query) = &query {
            builder = builder.query(query);
        }
        let response = builder.json(&body).send().await.map_err(error_from_reqwest)?;

        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }

        let (tx, rx) = mpsc::channel::<AppResult<OpenAIStreamChunk>>(64);

        tokio::spawn(async move {
            use futures::StreamExt;

            let mut bytes = response.bytes_stream();
            let mut lines = SseLineBuffer::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(error_from_reqwest(e))).await;
                        return;
                    }
                };

                for line in lines.push(&chunk) {
                    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    if data == "[DONE]" {
                        debug!("Upstream stream finished");
                        return;
                    }

                    match serde_json::from_str::<OpenAIStreamChunk>(data) {
                        Ok(parsed) => {
                            if tx.send(Ok(parsed)).await.is_err() {
                                debug!("Stream consumer dropped, stopping reader");
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("Malformed stream chunk: {}", e);
                            let _ = tx
                                .send(Err(AppError::UpstreamProtocol(format!(
                                    "malformed chunk: {}",
                                    e
                                ))))
                                .await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Buffered native Anthropic call: the original Claude body goes through
    /// with only endpoint and auth rewriting
    pub async fn anthropic_messages(
        &self,
        provider: &ProviderConfig,
        body: &serde_json::Value,
    ) -> AppResult<serde_json::Value> {
        let url = anthropic_messages_url(provider);
        let mut last_error: Option<AppError> = None;

        for attempt in 0..=self.max_retries {
            let result = self
                .client
                .post(&url)
                .header("x-api-key", provider.resolve_api_key())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            let error = match result {
                Ok(response) if response.status().is_success() => {
                    return response.json::<serde_json::Value>().await.map_err(|e| {
                        AppError::UpstreamProtocol(format!("invalid response body: {}", e))
                    });
                }
                Ok(response) => error_from_status(response).await,
                Err(e) => error_from_reqwest(e),
            };

            if !error.is_retryable() || attempt == self.max_retries {
                return Err(error);
            }
            last_error = Some(error);
            tokio::time::sleep(Duration::from_millis(250 * (attempt as u64 + 1))).await;
        }

        Err(last_error.unwrap_or_else(|| AppError::Internal("retry loop exhausted".to_string())))
    }

    /// Streaming native Anthropic call. Yields complete SSE frames (up to
    /// and including the blank-line terminator) so the caller can apply
    /// hooks at event boundaries and otherwise forward bytes unchanged.
    pub async fn anthropic_messages_stream(
        &self,
        provider: &ProviderConfig,
        body: &serde_json::Value,
    ) -> AppResult<ReceiverStream<AppResult<String>>> {
        let url = anthropic_messages_url(provider);

        let response = self
            .stream_client
            .post(&url)
            .header("x-api-key", provider.resolve_api_key())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(error_from_reqwest)?;

        if !response.status().is_success() {
            return Err(error_from_status(response).await);
        }

        let (tx, rx) = mpsc::channel::<AppResult<String>>(64);

        tokio::spawn(async move {
            use futures::StreamExt;

            let mut bytes = response.bytes_stream();
            let mut frames = SseFrameBuffer::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(error_from_reqwest(e))).await;
                        return;
                    }
                };

                for frame in frames.push(&chunk) {
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
            }

            // A partial trailing frame still reaches the client
            if let Some(rest) = frames.take_remainder() {
                let _ = tx.send(Ok(rest)).await;
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

fn chat_completions_url(provider: &ProviderConfig) -> String {
    format!("{}/chat/completions", provider.base_url.trim_end_matches('/'))
}

fn anthropic_messages_url(provider: &ProviderConfig) -> String {
    let base = provider.base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{}/messages", base)
    } else {
        format!("{}/v1/messages", base)
    }
}

/// Flatten `extra_query` into URL query pairs: string values go in plain,
/// structured values as JSON text
fn query_pairs(extra: &HashMap<String, serde_json::Value>) -> Vec<(String, String)> {
    extra
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect()
}

/// Map a transport-level reqwest failure onto the taxonomy
fn error_from_reqwest(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::UpstreamTimeout(e.to_string())
    } else {
        AppError::UpstreamTransport(e.to_string())
    }
}

/// Map a non-success upstream status onto the taxonomy, consuming the body
async fn error_from_status(response: Response) -> AppError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    // Prefer the provider's own error message when it parses
    let detail = serde_json::from_str::<OpenAIErrorResponse>(&body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| truncate(&body, 500));

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            error!("Upstream rejected credentials: {} - {}", status, detail);
            AppError::UpstreamAuth
        }
        StatusCode::TOO_MANY_REQUESTS => AppError::UpstreamRateLimited(detail),
        // The only other retryable statuses
        StatusCode::REQUEST_TIMEOUT => AppError::UpstreamTimeout(detail),
        StatusCode::TOO_EARLY => AppError::UpstreamTransport(detail),
        s => AppError::UpstreamProtocol(format!("{}: {}", s, detail)),
    }
}

/// Retry-After header in seconds, when present and sane
fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Cut to at most `max` bytes without splitting a UTF-8 sequence
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Incremental SSE line splitter. Network chunks can split a line anywhere;
/// this carries the partial tail across pushes.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: String,
}

impl SseLineBuffer {
    /// Feed bytes, returning the complete lines they finish
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }
}

/// Incremental SSE frame splitter: yields whole `event:`/`data:` blocks
/// terminated by a blank line
#[derive(Debug, Default)]
pub struct SseFrameBuffer {
    buf: String,
}

impl SseFrameBuffer {
    /// Feed bytes, returning the complete frames they finish (terminator
    /// included)
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.find("\n\n") {
            let frame: String = self.buf.drain(..pos + 2).collect();
            frames.push(frame);
        }
        frames
    }

    /// Remaining unterminated bytes, if any
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}
