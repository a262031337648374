//! Messages endpoint orchestrator
//!
//! Wires the pipeline together for every inbound Claude request: validate,
//! record, route, transform, translate, dispatch, stream back, finalize.

use crate::handlers::AppState;
use crate::models::claude::*;
use crate::services::streaming::{ClaudeEventAssembler, StreamState};
use crate::services::translator::new_message_id;
use crate::services::ResolvedModel;
use crate::storage::{HistoryStore, RecordStatus};
use crate::transformers::TransformerPipeline;
use crate::utils::error::{AppError, AppResult};
use crate::utils::token_count::estimate_input_tokens;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    Json,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

type SseSender = mpsc::Sender<Result<Event, Infallible>>;

/// POST /v1/messages
pub async fn handle_messages(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, AppError> {
    let claude_request: ClaudeRequest = serde_json::from_value(body.clone())
        .map_err(|e| AppError::InvalidRequest(format!("malformed request: {}", e)))?;
    validate_claude_request(&claude_request)?;

    let is_streaming = claude_request.stream.unwrap_or(false);
    debug!(
        "Processing request: model={}, stream={}",
        claude_request.model, is_streaming
    );

    let row_id = state
        .history
        .insert_pending(&claude_request.model, is_streaming, &body)
        .await?;

    let resolved = match state.router.resolve(&claude_request.model).await {
        Ok(resolved) => resolved,
        Err(e) => return Err(fail_row(&state.history, row_id, e).await),
    };

    let pipeline = state
        .transformers
        .pipeline_for(&resolved.provider.name, &resolved.concrete_model);

    if resolved.provider.is_anthropic() {
        handle_anthropic(state, row_id, body, is_streaming, resolved, pipeline).await
    } else {
        handle_openai(state, row_id, claude_request, is_streaming, resolved, pipeline).await
    }
}

/// OpenAI-compatible path: translate, transform, dispatch
async fn handle_openai(
    state: Arc<AppState>,
    row_id: i64,
    claude_request: ClaudeRequest,
    is_streaming: bool,
    resolved: ResolvedModel,
    pipeline: TransformerPipeline,
) -> Result<Response, AppError> {
    let claimed_model = claude_request.model.clone();

    let claude_request = pipeline.request_in(claude_request);
    let fallback_input =
        estimate_input_tokens(claude_request.system.as_ref(), &claude_request.messages);

    let openai_request = match state
        .translator
        .convert_request(&claude_request, &resolved.concrete_model)
    {
        Ok(req) => req,
        Err(e) => return Err(fail_row(&state.history, row_id, e).await),
    };
    let openai_request = pipeline.request_out(openai_request);

    let openai_json = serde_json::to_value(&openai_request)?;
    state
        .history
        .record_translation(
            row_id,
            &resolved.provider.name,
            &resolved.concrete_model,
            Some(&openai_json),
        )
        .await?;

    if is_streaming {
        handle_openai_stream(
            state,
            row_id,
            claimed_model,
            fallback_input,
            openai_request,
            resolved,
            pipeline,
        )
        .await
    } else {
        handle_openai_buffered(
            state,
            row_id,
            claimed_model,
            fallback_input,
            openai_request,
            resolved,
            pipeline,
        )
        .await
    }
}

async fn handle_openai_buffered(
    state: Arc<AppState>,
    row_id: i64,
    claimed_model: String,
    fallback_input: u32,
    openai_request: crate::models::openai::OpenAIRequest,
    resolved: ResolvedModel,
    pipeline: TransformerPipeline,
) -> Result<Response, AppError> {
    let response = match state
        .client
        .chat_completion(&resolved.provider, &openai_request)
        .await
    {
        Ok(response) => response,
        Err(e) => return Err(fail_row(&state.history, row_id, e).await),
    };

    let response = pipeline.response_in(response);

    let claude_response = match state
        .translator
        .convert_response(response, &claimed_model, fallback_input)
    {
        Ok(response) => response,
        Err(e) => return Err(fail_row(&state.history, row_id, e).await),
    };
    let claude_response = pipeline.response_out(claude_response);

    let response_json = serde_json::to_value(&claude_response)?;
    state
        .history
        .finish(
            row_id,
            RecordStatus::Completed,
            Some(&response_json),
            claude_response.stop_reason.as_deref(),
            claude_response.usage.input_tokens,
            claude_response.usage.output_tokens,
            None,
        )
        .await?;

    info!(
        "Completed request {} via {}:{}",
        row_id, resolved.provider.name, resolved.concrete_model
    );
    Ok(Json(claude_response).into_response())
}

async fn handle_openai_stream(
    state: Arc<AppState>,
    row_id: i64,
    claimed_model: String,
    fallback_input: u32,
    openai_request: crate::models::openai::OpenAIRequest,
    resolved: ResolvedModel,
    pipeline: TransformerPipeline,
) -> Result<Response, AppError> {
    let mut request = openai_request;
    request.stream = Some(true);

    // A failure before the first byte behaves as a non-streaming error
    let mut upstream = match state
        .client
        .chat_completion_stream(&resolved.provider, &request)
        .await
    {
        Ok(stream) => stream,
        Err(e) => return Err(fail_row(&state.history, row_id, e).await),
    };

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(100);
    let history = state.history.clone();

    tokio::spawn(async move {
        let mut machine = StreamState::new(new_message_id(), &claimed_model, fallback_input);
        let mut client_gone = false;

        'pump: {
            for event in machine.start() {
                if send_event(&tx, pipeline.event_out(event)).await.is_err() {
                    client_gone = true;
                    break 'pump;
                }
            }

            while let Some(item) = upstream.next().await {
                match item {
                    Ok(chunk) => {
                        let chunk = pipeline.chunk_in(chunk);
                        for event in machine.on_chunk(&chunk) {
                            if send_event(&tx, pipeline.event_out(event)).await.is_err() {
                                client_gone = true;
                                break 'pump;
                            }
                        }
                        if machine.is_finished() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Upstream stream failed mid-flight: {}", e);
                        for event in machine.fail(&e) {
                            let _ = send_event(&tx, pipeline.event_out(event)).await;
                        }
                        finalize_stream_row(
                            &history,
                            row_id,
                            &machine,
                            RecordStatus::Partial,
                            Some(&e.sanitized_message()),
                        )
                        .await;
                        return;
                    }
                }
            }

            // Upstream ended (e.g. [DONE] without a finish_reason): the
            // terminal pair still goes out
            if !machine.is_finished() {
                for event in machine.finish() {
                    if send_event(&tx, pipeline.event_out(event)).await.is_err() {
                        client_gone = true;
                        break;
                    }
                }
            }
        }

        if client_gone {
            debug!("Client disconnected from stream {}", row_id);
            // Upstream connection drops with the stream handle
            finalize_stream_row(
                &history,
                row_id,
                &machine,
                RecordStatus::Partial,
                Some("client disconnected"),
            )
            .await;
        } else {
            finalize_stream_row(&history, row_id, &machine, RecordStatus::Completed, None).await;
        }
    });

    let sse = Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .event(Event::default().event("ping").data("{\"type\": \"ping\"}")),
    );
    Ok(sse.into_response())
}

/// Native Anthropic passthrough: no translation, hooks at event boundaries
async fn handle_anthropic(
    state: Arc<AppState>,
    row_id: i64,
    body: serde_json::Value,
    is_streaming: bool,
    resolved: ResolvedModel,
    pipeline: TransformerPipeline,
) -> Result<Response, AppError> {
    state
        .history
        .record_translation(row_id, &resolved.provider.name, &resolved.concrete_model, None)
        .await?;

    if !is_streaming {
        let response = match state
            .client
            .anthropic_messages(&resolved.provider, &body)
            .await
        {
            Ok(response) => response,
            Err(e) => return Err(fail_row(&state.history, row_id, e).await),
        };

        // Responses that parse as a Message go through response_out;
        // unknown shapes are forwarded untouched
        let (out, stop_reason, usage) =
            match serde_json::from_value::<ClaudeResponse>(response.clone()) {
                Ok(parsed) => {
                    let parsed = pipeline.response_out(parsed);
                    let stop = parsed.stop_reason.clone();
                    let usage = parsed.usage.clone();
                    (serde_json::to_value(&parsed)?, stop, usage)
                }
                Err(_) => {
                    warn!("Upstream response did not parse as a Message, forwarding verbatim");
                    (response, None, ClaudeUsage::default())
                }
            };

        state
            .history
            .finish(
                row_id,
                RecordStatus::Completed,
                Some(&out),
                stop_reason.as_deref(),
                usage.input_tokens,
                usage.output_tokens,
                None,
            )
            .await?;

        return Ok(Json(out).into_response());
    }

    let mut frames = match state
        .client
        .anthropic_messages_stream(&resolved.provider, &body)
        .await
    {
        Ok(frames) => frames,
        Err(e) => return Err(fail_row(&state.history, row_id, e).await),
    };

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(100);
    let history = state.history.clone();

    tokio::spawn(async move {
        let mut assembler = ClaudeEventAssembler::new();
        let mut client_gone = false;
        let mut stream_error: Option<String> = None;

        while let Some(item) = frames.next().await {
            match item {
                Ok(frame) => {
                    let (name, data) = parse_sse_frame(&frame);
                    let Some(data) = data else { continue };

                    let event = match serde_json::from_str::<ClaudeStreamEvent>(&data) {
                        Ok(event) => {
                            let event = pipeline.event_out(event);
                            assembler.apply(&event);
                            sse_from_stream_event(&event)
                        }
                        // Unknown event types pass through unchanged
                        Err(_) => {
                            let event = Event::default().data(data);
                            match name {
                                Some(name) => event.event(name),
                                None => event,
                            }
                        }
                    };

                    if tx.send(Ok(event)).await.is_err() {
                        client_gone = true;
                        break;
                    }
                }
                Err(e) => {
                    warn!("Anthropic passthrough stream failed: {}", e);
                    for event in error_terminal_events(&e) {
                        assembler.apply(&event);
                        let _ = tx.send(Ok(sse_from_stream_event(&event))).await;
                    }
                    stream_error = Some(e.sanitized_message());
                    break;
                }
            }
        }

        let complete = assembler.is_stopped() && !client_gone && stream_error.is_none();
        let status = if complete {
            RecordStatus::Completed
        } else {
            RecordStatus::Partial
        };
        let error = if client_gone {
            Some("client disconnected".to_string())
        } else {
            stream_error
        };

        let usage = assembler.usage().clone();
        let stop_reason = assembler.stop_reason().map(String::from);
        let assembled = assembler.into_response();
        let response_json = serde_json::to_value(&assembled).ok();

        if let Err(e) = history
            .finish(
                row_id,
                status,
                response_json.as_ref(),
                stop_reason.as_deref().or(Some("end_turn")),
                usage.input_tokens,
                usage.output_tokens,
                error.as_deref(),
            )
            .await
        {
            error!("Failed to finalize history row {}: {}", row_id, e);
        }
    });

    let sse = Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .event(Event::default().event("ping").data("{\"type\": \"ping\"}")),
    );
    Ok(sse.into_response())
}

/// POST /v1/messages/count_tokens
pub async fn count_tokens(
    State(_state): State<Arc<AppState>>,
    Json(request): Json<ClaudeTokenCountRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if request.model.is_empty() {
        return Err(AppError::InvalidRequest(
            "model name cannot be empty".to_string(),
        ));
    }

    let input_tokens = estimate_input_tokens(request.system.as_ref(), &request.messages);
    Ok(Json(serde_json::json!({ "input_tokens": input_tokens })))
}

/// Basic request validation before anything is dispatched
pub fn validate_claude_request(request: &ClaudeRequest) -> AppResult<()> {
    if request.model.is_empty() {
        return Err(AppError::InvalidRequest(
            "model name cannot be empty".to_string(),
        ));
    }

    if request.max_tokens == 0 {
        return Err(AppError::InvalidRequest(
            "max_tokens must be greater than 0".to_string(),
        ));
    }

    if request.messages.is_empty() {
        return Err(AppError::InvalidRequest(
            "messages cannot be empty".to_string(),
        ));
    }

    for (i, message) in request.messages.iter().enumerate() {
        if !matches!(message.role.as_str(), "user" | "assistant") {
            return Err(AppError::InvalidRequest(format!(
                "message {} has invalid role '{}'",
                i, message.role
            )));
        }
    }

    if let Some(temperature) = request.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(AppError::InvalidRequest(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
    }

    if let Some(top_p) = request.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            return Err(AppError::InvalidRequest(
                "top_p must be between 0.0 and 1.0".to_string(),
            ));
        }
    }

    // A named tool_choice must reference a defined tool
    if let Some(ClaudeToolChoice::Tool { name }) = &request.tool_choice {
        let known = request
            .tools
            .as_ref()
            .map(|tools| tools.iter().any(|t| &t.name == name))
            .unwrap_or(false);
        if !known {
            return Err(AppError::InvalidRequest(format!(
                "tool_choice references unknown tool '{}'",
                name
            )));
        }
    }

    Ok(())
}

/// Mark the row failed and hand the error back for the HTTP response
async fn fail_row(history: &HistoryStore, row_id: i64, error: AppError) -> AppError {
    let message = error.sanitized_message();
    if let Err(e) = history
        .finish(
            row_id,
            RecordStatus::Error,
            None,
            Some("error"),
            0,
            0,
            Some(&message),
        )
        .await
    {
        error!("Failed to mark history row {} as error: {}", row_id, e);
    }
    error
}

/// Write the terminal snapshot of a streaming request
async fn finalize_stream_row(
    history: &HistoryStore,
    row_id: i64,
    machine: &StreamState,
    status: RecordStatus,
    error: Option<&str>,
) {
    let assembled = machine.assembled();
    let usage = machine.final_usage();
    let response_json = serde_json::to_value(&assembled).ok();

    if let Err(e) = history
        .finish(
            row_id,
            status,
            response_json.as_ref(),
            assembled.stop_reason.as_deref(),
            usage.input_tokens,
            usage.output_tokens,
            error,
        )
        .await
    {
        error!("Failed to finalize history row {}: {}", row_id, e);
    }
}

/// Serialize one Claude event onto the SSE channel
async fn send_event(tx: &SseSender, event: ClaudeStreamEvent) -> Result<(), ()> {
    tx.send(Ok(sse_from_stream_event(&event)))
        .await
        .map_err(|_| ())
}

fn sse_from_stream_event(event: &ClaudeStreamEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.event_name()).data(data)
}

/// The closing sequence for a passthrough stream that failed mid-flight
fn error_terminal_events(error: &AppError) -> Vec<ClaudeStreamEvent> {
    vec![
        ClaudeStreamEvent::Error {
            error: ClaudeError {
                error_type: error.error_type().to_string(),
                message: error.sanitized_message(),
            },
        },
        ClaudeStreamEvent::MessageDelta {
            delta: ClaudeMessageDelta {
                stop_reason: Some("error".to_string()),
                stop_sequence: None,
            },
            usage: ClaudeUsage::default(),
        },
        ClaudeStreamEvent::MessageStop,
    ]
}

/// Split an SSE frame into its event name and joined data payload
fn parse_sse_frame(frame: &str) -> (Option<&str>, Option<String>) {
    let mut name = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in frame.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            name = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim_start());
        }
    }

    let data = if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    };
    (name, data)
}
