//! Streaming state machine
//!
//! Consumes OpenAI chat-completion chunks and emits the Claude SSE event
//! sequence: `message_start`, content-block lifecycles, `message_delta`,
//! `message_stop`. The machine also assembles the final `Message` from the
//! same state so the history row is written from a complete snapshot rather
//! than partial mutations.
//!
//! Block rules: text and tool-use deltas never interleave. A chunk that
//! carries both a content fragment and a new tool call closes the text block
//! first, then opens the tool block at the next index.

use crate::models::claude::*;
use crate::models::openai::{OpenAIStreamChunk, OpenAIUsage};
use crate::services::translator::{map_finish_reason, parse_tool_arguments};
use crate::utils::error::AppError;
use crate::utils::token_count::estimate_tokens;
use std::collections::HashMap;
use tracing::debug;

/// Tracking state for one upstream tool call
#[derive(Debug, Default)]
struct ToolTrack {
    id: Option<String>,
    name: Option<String>,
    args: String,
    claude_index: Option<u32>,
    started: bool,
}

/// The per-request streaming state machine
pub struct StreamState {
    message_id: String,
    /// Model name as claimed by the client
    model: String,
    /// Request-side token estimate used when upstream reports no usage
    fallback_input_tokens: u32,

    next_index: u32,
    /// Accumulated text blocks as (block index, content)
    texts: Vec<(u32, String)>,
    /// Position in `texts` of the open text block
    open_text: Option<usize>,
    /// Tool calls keyed by the upstream tool_calls index
    tools: HashMap<u32, ToolTrack>,
    /// Upstream indices in arrival order
    tool_arrival: Vec<u32>,

    usage: Option<OpenAIUsage>,
    stop_reason: Option<String>,
    started: bool,
    finished: bool,
}

impl StreamState {
    pub fn new(message_id: String, claimed_model: &str, fallback_input_tokens: u32) -> Self {
        Self {
            message_id,
            model: claimed_model.to_string(),
            fallback_input_tokens,
            next_index: 0,
            texts: Vec::new(),
            open_text: None,
            tools: HashMap::new(),
            tool_arrival: Vec::new(),
            usage: None,
            stop_reason: None,
            started: false,
            finished: false,
        }
    }

    /// Header events, emitted once before any chunk is processed
    pub fn start(&mut self) -> Vec<ClaudeStreamEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;

        vec![ClaudeStreamEvent::MessageStart {
            message: ClaudeStreamMessage {
                id: self.message_id.clone(),
                message_type: "message".to_string(),
                role: "assistant".to_string(),
                content: vec![],
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: ClaudeUsage::default(),
            },
        }]
    }

    /// Process one upstream chunk into zero or more Claude events
    pub fn on_chunk(&mut self, chunk: &OpenAIStreamChunk) -> Vec<ClaudeStreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        // Usage often rides on the final chunk only
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(content) = choice.delta.content.as_deref() {
            if !content.is_empty() {
                self.emit_text_delta(content, &mut events);
            }
        }

        if let Some(tool_deltas) = &choice.delta.tool_calls {
            for tc in tool_deltas {
                let track = self.tools.entry(tc.index).or_default();
                if let Some(id) = &tc.id {
                    track.id = Some(id.clone());
                }
                if let Some(name) = &tc.function.name {
                    track.name = Some(name.clone());
                }

                // Open the block once id and name are both known
                if !track.started && track.id.is_some() && track.name.is_some() {
                    let id = track.id.clone().unwrap();
                    let name = track.name.clone().unwrap();

                    // Fixed rule: close the text block before opening a tool block
                    if let Some(pos) = self.open_text.take() {
                        events.push(ClaudeStreamEvent::ContentBlockStop {
                            index: self.texts[pos].0,
                        });
                    }

                    let index = self.next_index;
                    self.next_index += 1;

                    let track = self.tools.get_mut(&tc.index).unwrap();
                    track.claude_index = Some(index);
                    track.started = true;
                    self.tool_arrival.push(tc.index);

                    events.push(ClaudeStreamEvent::ContentBlockStart {
                        index,
                        content_block: ClaudeContentBlock::ToolUse {
                            id,
                            name,
                            input: serde_json::json!({}),
                        },
                    });
                }

                let track = self.tools.get_mut(&tc.index).unwrap();
                if track.started {
                    if let Some(fragment) = &tc.function.arguments {
                        if !fragment.is_empty() {
                            track.args.push_str(fragment);
                            events.push(ClaudeStreamEvent::ContentBlockDelta {
                                index: track.claude_index.unwrap(),
                                delta: ClaudeContentDelta::InputJsonDelta {
                                    partial_json: fragment.clone(),
                                },
                            });
                        }
                    }
                }
            }
        }

        if let Some(finish_reason) = choice.finish_reason.as_deref() {
            debug!("Upstream finish_reason: {}", finish_reason);
            // A turn that opened tool blocks ends in tool_use regardless of
            // what the upstream claims
            self.stop_reason = Some(if self.tool_arrival.is_empty() {
                map_finish_reason(Some(finish_reason))
            } else {
                "tool_use".to_string()
            });
            events.extend(self.finish());
        }

        events
    }

    fn emit_text_delta(&mut self, content: &str, events: &mut Vec<ClaudeStreamEvent>) {
        let pos = match self.open_text {
            Some(pos) => pos,
            None => {
                // Text after tool blocks: close them, then open a fresh text
                // block at the next index
                self.close_open_tools(events);

                let index = self.next_index;
                self.next_index += 1;
                self.texts.push((index, String::new()));
                events.push(ClaudeStreamEvent::ContentBlockStart {
                    index,
                    content_block: ClaudeContentBlock::Text {
                        text: String::new(),
                    },
                });
                let pos = self.texts.len() - 1;
                self.open_text = Some(pos);
                pos
            }
        };

        self.texts[pos].1.push_str(content);
        events.push(ClaudeStreamEvent::ContentBlockDelta {
            index: self.texts[pos].0,
            delta: ClaudeContentDelta::TextDelta {
                text: content.to_string(),
            },
        });
    }

    fn close_open_tools(&mut self, events: &mut Vec<ClaudeStreamEvent>) {
        for key in &self.tool_arrival {
            if let Some(track) = self.tools.get_mut(key) {
                if track.started {
                    if let Some(index) = track.claude_index {
                        events.push(ClaudeStreamEvent::ContentBlockStop { index });
                    }
                    track.started = false;
                }
            }
        }
    }

    /// Close any open blocks and emit the terminal pair. Idempotent; called
    /// on the normal end, on `[DONE]` without a finish_reason, and by
    /// `fail`.
    pub fn finish(&mut self) -> Vec<ClaudeStreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();

        if let Some(pos) = self.open_text.take() {
            events.push(ClaudeStreamEvent::ContentBlockStop {
                index: self.texts[pos].0,
            });
        }
        self.close_open_tools(&mut events);

        let stop_reason = self
            .stop_reason
            .clone()
            .unwrap_or_else(|| "end_turn".to_string());

        events.push(ClaudeStreamEvent::MessageDelta {
            delta: ClaudeMessageDelta {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: self.final_usage(),
        });
        events.push(ClaudeStreamEvent::MessageStop);
        events
    }

    /// Terminate after a mid-stream failure: error event, then the closing
    /// sequence with `stop_reason="error"`
    pub fn fail(&mut self, error: &AppError) -> Vec<ClaudeStreamEvent> {
        let mut events = vec![ClaudeStreamEvent::Error {
            error: crate::models::claude::ClaudeError {
                error_type: error.error_type().to_string(),
                message: error.sanitized_message(),
            },
        }];
        self.stop_reason = Some("error".to_string());
        events.extend(self.finish());
        events
    }

    /// Whether the terminal pair has been emitted
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether any event-producing chunk has been processed
    pub fn has_output(&self) -> bool {
        !self.texts.is_empty() || !self.tool_arrival.is_empty()
    }

    /// Final usage: upstream-reported when available, estimated otherwise
    pub fn final_usage(&self) -> ClaudeUsage {
        let estimate = || {
            let output = estimate_tokens(&self.full_text())
                + self
                    .tool_arrival
                    .iter()
                    .filter_map(|k| self.tools.get(k))
                    .map(|t| estimate_tokens(&t.args))
                    .sum::<u32>();
            (self.fallback_input_tokens, output)
        };
        crate::services::translator::claude_usage_from(self.usage.as_ref(), estimate)
    }

    /// Concatenation of all emitted text deltas
    pub fn full_text(&self) -> String {
        self.texts
            .iter()
            .map(|(_, text)| text.as_str())
            .collect()
    }

    /// Stop reason recorded so far
    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    /// Assemble the complete `Message` from the accumulated state
    pub fn assembled(&self) -> ClaudeResponse {
        #[derive(Debug)]
        enum Slot<'a> {
            Text(&'a str),
            Tool(&'a ToolTrack),
        }

        let mut slots: Vec<(u32, Slot)> = self
            .texts
            .iter()
            .map(|(index, text)| (*index, Slot::Text(text.as_str())))
            .collect();
        for key in &self.tool_arrival {
            if let Some(track) = self.tools.get(key) {
                if let Some(index) = track.claude_index {
                    slots.push((index, Slot::Tool(track)));
                }
            }
        }
        slots.sort_by_key(|(index, _)| *index);

        let mut content: Vec<ClaudeContentBlock> = slots
            .into_iter()
            .map(|(_, slot)| match slot {
                Slot::Text(text) => ClaudeContentBlock::Text {
                    text: text.to_string(),
                },
                Slot::Tool(track) => ClaudeContentBlock::ToolUse {
                    id: track.id.clone().unwrap_or_default(),
                    name: track.name.clone().unwrap_or_default(),
                    input: parse_tool_arguments(&track.args),
                },
            })
            .collect();

        if content.is_empty() {
            content.push(ClaudeContentBlock::Text {
                text: String::new(),
            });
        }

        ClaudeResponse {
            id: self.message_id.clone(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: self.model.clone(),
            stop_reason: self.stop_reason.clone().or(Some("end_turn".to_string())),
            stop_sequence: None,
            usage: self.final_usage(),
        }
    }
}

/// Rebuilds a complete `Message` by applying Claude stream events in order
/// to an empty skeleton. Used to record passthrough streams in history and
/// to check stream/non-stream equivalence.
#[derive(Debug, Default)]
pub struct ClaudeEventAssembler {
    message_id: Option<String>,
    model: Option<String>,
    blocks: Vec<(u32, ClaudeContentBlock)>,
    tool_args: HashMap<u32, String>,
    stop_reason: Option<String>,
    stop_sequence: Option<String>,
    usage: ClaudeUsage,
    stopped: bool,
}

impl ClaudeEventAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &ClaudeStreamEvent) {
        match event {
            ClaudeStreamEvent::MessageStart { message } => {
                self.message_id = Some(message.id.clone());
                self.model = Some(message.model.clone());
                self.usage = message.usage.clone();
            }
            ClaudeStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                self.blocks.push((*index, content_block.clone()));
            }
            ClaudeStreamEvent::ContentBlockDelta { index, delta } => match delta {
                ClaudeContentDelta::TextDelta { text } => {
                    if let Some((_, ClaudeContentBlock::Text { text: existing })) =
                        self.blocks.iter_mut().find(|(i, _)| i == index)
                    {
                        existing.push_str(text);
                    }
                }
                ClaudeContentDelta::InputJsonDelta { partial_json } => {
                    self.tool_args
                        .entry(*index)
                        .or_default()
                        .push_str(partial_json);
                }
            },
            ClaudeStreamEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.stop_reason = delta.stop_reason.clone();
                }
                if delta.stop_sequence.is_some() {
                    self.stop_sequence = delta.stop_sequence.clone();
                }
                if usage.input_tokens > 0 || usage.output_tokens > 0 {
                    self.usage = usage.clone();
                }
            }
            ClaudeStreamEvent::MessageStop => self.stopped = true,
            ClaudeStreamEvent::ContentBlockStop { .. }
            | ClaudeStreamEvent::Ping
            | ClaudeStreamEvent::Error { .. } => {}
        }
    }

    /// Whether a `message_stop` has been seen
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn usage(&self) -> &ClaudeUsage {
        &self.usage
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }

    /// The assembled message
    pub fn into_response(mut self) -> ClaudeResponse {
        self.blocks.sort_by_key(|(index, _)| *index);

        let mut content: Vec<ClaudeContentBlock> = Vec::new();
        for (index, block) in self.blocks {
            match block {
                ClaudeContentBlock::ToolUse { id, name, input } => {
                    let input = match self.tool_args.get(&index) {
                        Some(args) if !args.is_empty() => parse_tool_arguments(args),
                        _ => input,
                    };
                    content.push(ClaudeContentBlock::ToolUse { id, name, input });
                }
                other => content.push(other),
            }
        }
        if content.is_empty() {
            content.push(ClaudeContentBlock::Text {
                text: String::new(),
            });
        }

        ClaudeResponse {
            id: self.message_id.unwrap_or_else(crate::services::translator::new_message_id),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: self.model.unwrap_or_default(),
            stop_reason: self.stop_reason.or(Some("end_turn".to_string())),
            stop_sequence: self.stop_sequence,
            usage: self.usage,
        }
    }
}
