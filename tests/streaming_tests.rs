//! Streaming state machine integration tests
//!
//! Covers the event-ordering guarantees: block lifecycles, terminal pairs on
//! every exit path and stream/non-stream equivalence.

use ccproxy::models::claude::*;
use ccproxy::models::openai::*;
use ccproxy::services::streaming::ClaudeEventAssembler;
use ccproxy::services::StreamState;
use ccproxy::utils::error::AppError;

fn chunk(delta: OpenAIStreamDelta, finish: Option<&str>) -> OpenAIStreamChunk {
    OpenAIStreamChunk {
        id: "chatcmpl-stream".to_string(),
        object: "chat.completion.chunk".to_string(),
        created: 1700000000,
        model: "gpt-4o-mini".to_string(),
        choices: vec![OpenAIStreamChoice {
            index: 0,
            delta,
            finish_reason: finish.map(String::from),
        }],
        usage: None,
    }
}

fn text_delta(text: &str) -> OpenAIStreamDelta {
    OpenAIStreamDelta {
        role: None,
        content: Some(text.to_string()),
        tool_calls: None,
    }
}

fn tool_delta(index: u32, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> OpenAIStreamDelta {
    OpenAIStreamDelta {
        role: None,
        content: None,
        tool_calls: Some(vec![OpenAIToolCallDelta {
            index,
            id: id.map(String::from),
            tool_type: Some("function".to_string()),
            function: OpenAIFunctionCallDelta {
                name: name.map(String::from),
                arguments: args.map(String::from),
            },
        }]),
    }
}

fn drive(chunks: Vec<OpenAIStreamChunk>) -> (StreamState, Vec<ClaudeStreamEvent>) {
    let mut machine = StreamState::new("msg_stream_test".to_string(), "claude-3-5-haiku-20241022", 8);
    let mut events = machine.start();
    for c in &chunks {
        events.extend(machine.on_chunk(c));
    }
    events.extend(machine.finish());
    (machine, events)
}

/// E2: the exact event sequence for a streamed text answer
#[test]
fn test_streaming_text_event_sequence() {
    let (_, events) = drive(vec![
        chunk(text_delta("Hi"), None),
        chunk(text_delta(" there"), None),
        chunk(OpenAIStreamDelta::default(), Some("stop")),
    ]);

    let names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );

    // content_block_start at index 0 with type text
    match &events[1] {
        ClaudeStreamEvent::ContentBlockStart {
            index,
            content_block: ClaudeContentBlock::Text { .. },
        } => assert_eq!(*index, 0),
        other => panic!("expected text block start, got {:?}", other),
    }

    // message_delta carries end_turn
    match &events[5] {
        ClaudeStreamEvent::MessageDelta { delta, .. } => {
            assert_eq!(delta.stop_reason.as_deref(), Some("end_turn"));
        }
        other => panic!("expected message_delta, got {:?}", other),
    }
}

/// Stream/non-stream equivalence: concatenated text deltas equal the
/// assembled text
#[test]
fn test_stream_text_equals_assembled_text() {
    let fragments = ["Streaming ", "responses ", "are ", "chunked."];
    let mut chunks: Vec<OpenAIStreamChunk> =
        fragments.iter().map(|f| chunk(text_delta(f), None)).collect();
    chunks.push(chunk(OpenAIStreamDelta::default(), Some("stop")));

    let (machine, events) = drive(chunks);

    let delta_text: String = events
        .iter()
        .filter_map(|e| match e {
            ClaudeStreamEvent::ContentBlockDelta {
                delta: ClaudeContentDelta::TextDelta { text },
                ..
            } => Some(text.as_str()),
            _ => None,
        })
        .collect();

    assert_eq!(delta_text, fragments.concat());
    assert_eq!(machine.assembled().text(), fragments.concat());
}

/// Tool-call preservation: ids and parsed inputs survive streaming; block
/// count equals call count
#[test]
fn test_tool_call_preservation() {
    let (machine, events) = drive(vec![
        chunk(tool_delta(0, Some("call_a"), Some("get_weather"), None), None),
        chunk(tool_delta(0, None, None, Some(r#"{"city":"#)), None),
        chunk(tool_delta(0, None, None, Some(r#" "Paris"}"#)), None),
        chunk(tool_delta(1, Some("call_b"), Some("get_time"), Some(r#"{"tz": "CET"}"#)), None),
        chunk(OpenAIStreamDelta::default(), Some("tool_calls")),
    ]);

    let assembled = machine.assembled();
    let uses = assembled.tool_uses();
    assert_eq!(uses.len(), 2);
    assert_eq!(uses[0].0, "call_a");
    assert_eq!(uses[0].2["city"], "Paris");
    assert_eq!(uses[1].0, "call_b");
    assert_eq!(uses[1].2["tz"], "CET");

    // Each tool_use block has exactly one start and one stop
    let starts = events
        .iter()
        .filter(|e| matches!(e, ClaudeStreamEvent::ContentBlockStart { .. }))
        .count();
    let stops = events
        .iter()
        .filter(|e| matches!(e, ClaudeStreamEvent::ContentBlockStop { .. }))
        .count();
    assert_eq!(starts, 2);
    assert_eq!(stops, 2);
    assert_eq!(assembled.stop_reason.as_deref(), Some("tool_use"));
}

/// State-machine completeness: exactly one message_stop and balanced block
/// lifecycles on every exit path, including failures
#[test]
fn test_completeness_on_error_path() {
    let mut machine = StreamState::new("msg_err".to_string(), "claude-3-opus", 5);
    let mut events = machine.start();
    events.extend(machine.on_chunk(&chunk(text_delta("partial out"), None)));
    events.extend(machine.fail(&AppError::UpstreamTransport("connection reset".to_string())));

    let message_stops = events
        .iter()
        .filter(|e| matches!(e, ClaudeStreamEvent::MessageStop))
        .count();
    assert_eq!(message_stops, 1);

    let starts = events
        .iter()
        .filter(|e| matches!(e, ClaudeStreamEvent::ContentBlockStart { .. }))
        .count();
    let stops = events
        .iter()
        .filter(|e| matches!(e, ClaudeStreamEvent::ContentBlockStop { .. }))
        .count();
    assert_eq!(starts, stops);

    assert!(events
        .iter()
        .any(|e| matches!(e, ClaudeStreamEvent::Error { .. })));
    assert_eq!(machine.stop_reason(), Some("error"));

    // Nothing further comes out of a finished machine
    assert!(machine.on_chunk(&chunk(text_delta("late"), None)).is_empty());
    assert!(machine.finish().is_empty());
}

/// The fixed mixed-chunk rule: a chunk with both content and a new tool call
/// closes the text block first, then opens the tool block
#[test]
fn test_mixed_chunk_closes_text_first() {
    let mixed = OpenAIStreamDelta {
        role: None,
        content: Some("thinking...".to_string()),
        tool_calls: Some(vec![OpenAIToolCallDelta {
            index: 0,
            id: Some("call_mix".to_string()),
            tool_type: Some("function".to_string()),
            function: OpenAIFunctionCallDelta {
                name: Some("lookup".to_string()),
                arguments: None,
            },
        }]),
    };

    let (_, events) = drive(vec![
        chunk(mixed, None),
        chunk(OpenAIStreamDelta::default(), Some("tool_calls")),
    ]);

    let sequence: Vec<String> = events
        .iter()
        .map(|e| match e {
            ClaudeStreamEvent::ContentBlockStart { index, .. } => format!("start:{}", index),
            ClaudeStreamEvent::ContentBlockStop { index } => format!("stop:{}", index),
            ClaudeStreamEvent::ContentBlockDelta { index, .. } => format!("delta:{}", index),
            other => other.event_name().to_string(),
        })
        .collect();

    assert_eq!(
        sequence,
        vec![
            "message_start",
            "start:0",
            "delta:0",
            "stop:0",
            "start:1",
            "stop:1",
            "message_delta",
            "message_stop",
        ]
    );
}

/// Reassembling the emitted events yields the same message the machine
/// assembled directly
#[test]
fn test_event_log_reassembly_matches() {
    let (machine, events) = drive(vec![
        chunk(text_delta("answer: "), None),
        chunk(tool_delta(0, Some("call_1"), Some("calc"), Some(r#"{"expr": "1+1"}"#)), None),
        chunk(OpenAIStreamDelta::default(), Some("tool_calls")),
    ]);

    let mut assembler = ClaudeEventAssembler::new();
    for event in &events {
        assembler.apply(event);
    }
    assert!(assembler.is_stopped());

    let reassembled = assembler.into_response();
    let direct = machine.assembled();

    assert_eq!(reassembled.text(), direct.text());
    assert_eq!(reassembled.stop_reason, direct.stop_reason);
    assert_eq!(
        serde_json::to_value(reassembled.tool_uses()).unwrap(),
        serde_json::to_value(direct.tool_uses()).unwrap()
    );
}

/// Usage accumulates from whichever chunk carries it
#[test]
fn test_usage_accumulation() {
    let mut final_chunk = chunk(OpenAIStreamDelta::default(), Some("stop"));
    final_chunk.usage = Some(OpenAIUsage {
        prompt_tokens: 100,
        completion_tokens: 20,
        total_tokens: 120,
        prompt_tokens_details: None,
    });

    let (machine, events) = drive(vec![chunk(text_delta("hi"), None), final_chunk]);

    let usage = machine.final_usage();
    assert_eq!(usage.input_tokens, 100);
    assert_eq!(usage.output_tokens, 20);

    // The message_delta carries the same numbers
    let delta_usage = events
        .iter()
        .find_map(|e| match e {
            ClaudeStreamEvent::MessageDelta { usage, .. } => Some(usage.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(delta_usage.input_tokens, 100);
    assert_eq!(delta_usage.output_tokens, 20);
}
