//! Protocol conversion benchmarks

use ccproxy::config::ServerSettings;
use ccproxy::models::claude::*;
use ccproxy::models::openai::*;
use ccproxy::services::{StreamState, Translator};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

fn sample_request(message_count: usize) -> ClaudeRequest {
    let messages = (0..message_count)
        .map(|i| ClaudeMessage {
            role: if i % 2 == 0 { "user" } else { "assistant" }.to_string(),
            content: ClaudeContent::Text(format!(
                "Message number {} with a reasonable amount of conversational text in it.",
                i
            )),
        })
        .collect();

    ClaudeRequest {
        model: "claude-3-5-sonnet-20241022".to_string(),
        max_tokens: 1024,
        messages,
        system: Some(SystemPrompt::Text(
            "You are a helpful assistant.".to_string(),
        )),
        tools: Some(vec![ClaudeTool {
            name: "get_weather".to_string(),
            description: Some("Current weather for a city".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
        }]),
        ..Default::default()
    }
}

fn bench_request_conversion(c: &mut Criterion) {
    let translator = Translator::new(&ServerSettings::default());

    let mut group = c.benchmark_group("request_conversion");
    for size in [2usize, 10, 50] {
        let request = sample_request(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &request, |b, req| {
            b.iter(|| translator.convert_request(black_box(req), "gpt-4o").unwrap());
        });
    }
    group.finish();
}

fn bench_stream_chunks(c: &mut Criterion) {
    let chunks: Vec<OpenAIStreamChunk> = (0..100)
        .map(|i| OpenAIStreamChunk {
            id: "chatcmpl-bench".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: 1700000000,
            model: "gpt-4o".to_string(),
            choices: vec![OpenAIStreamChoice {
                index: 0,
                delta: OpenAIStreamDelta {
                    role: None,
                    content: Some(format!("token{} ", i)),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            usage: None,
        })
        .collect();

    c.bench_function("stream_100_text_chunks", |b| {
        b.iter(|| {
            let mut machine = StreamState::new("msg_bench".to_string(), "claude-3-5-sonnet", 100);
            let mut events = machine.start();
            for chunk in &chunks {
                events.extend(machine.on_chunk(black_box(chunk)));
            }
            events.extend(machine.finish());
            black_box(events)
        });
    });
}

criterion_group!(benches, bench_request_conversion, bench_stream_chunks);
criterion_main!(benches);
