//! SSE frame decoding and content-block state tracking for the Claude
//! streaming API.

use serde_json::Value;
use std::collections::HashMap;
use tracing::{trace, warn};

use dchat_tool_runtime::stream::{StopReason, StreamEvent};

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Incremental SSE decoder. Bytes are buffered until a full line is
/// available, so multi-byte characters split across chunks stay intact.
#[derive(Debug, Default)]
pub(super) struct SseDecoder {
    buffer: Vec<u8>,
    event: String,
    data: Vec<String>,
}

impl SseDecoder {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every frame it completed.
    pub(super) fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.trim_end_matches('\r');
            if let Some(frame) = self.line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing frame that was not terminated by a blank line.
    pub(super) fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            // a non-empty line never dispatches on its own
            let _ = self.line(line.trim_end_matches('\r'));
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // comment
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = value.to_string(),
            "data" => self.data.push(value.to_string()),
            _ => trace!(field, "ignoring SSE field"),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = std::mem::take(&mut self.event);
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Block {
    Text,
    Thinking,
    ToolUse { id: String },
    Other,
}

/// Tracks open content blocks by index so deltas and stops can be
/// attributed to the right tool_use id.
#[derive(Debug, Default)]
pub(super) struct BlockTracker {
    blocks: HashMap<u64, Block>,
}

impl BlockTracker {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Translate one SSE frame into zero or more [`StreamEvent`]s.
    pub(super) fn translate(&mut self, frame: &SseFrame) -> Vec<StreamEvent> {
        let parsed: Value = match serde_json::from_str(&frame.data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(event = %frame.event, error = %e, "unparseable SSE data");
                return Vec::new();
            }
        };
        let event_type = if frame.event.is_empty() {
            parsed["type"].as_str().unwrap_or_default()
        } else {
            frame.event.as_str()
        };
        let index = parsed["index"].as_u64().unwrap_or(0);
        let mut events = Vec::new();

        match event_type {
            "content_block_start" => {
                let block = &parsed["content_block"];
                match block["type"].as_str() {
                    Some("text") => {
                        self.blocks.insert(index, Block::Text);
                        if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                            events.push(StreamEvent::TextDelta {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("thinking") => {
                        self.blocks.insert(index, Block::Thinking);
                        if let Some(text) = block["thinking"].as_str().filter(|t| !t.is_empty()) {
                            events.push(StreamEvent::ReasoningDelta {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("tool_use") => {
                        let id = block["id"].as_str().unwrap_or_default().to_string();
                        let name = block["name"].as_str().unwrap_or_default().to_string();
                        self.blocks.insert(index, Block::ToolUse { id: id.clone() });
                        events.push(StreamEvent::ToolCallStart { id, name });
                    }
                    _ => {
                        self.blocks.insert(index, Block::Other);
                    }
                }
            }
            "content_block_delta" => {
                let delta = &parsed["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str() {
                            events.push(StreamEvent::TextDelta {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = delta["thinking"].as_str() {
                            events.push(StreamEvent::ReasoningDelta {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("input_json_delta") => match self.blocks.get(&index) {
                        Some(Block::ToolUse { id }) => {
                            events.push(StreamEvent::ToolCallDelta {
                                id: id.clone(),
                                arguments_delta: delta["partial_json"]
                                    .as_str()
                                    .unwrap_or_default()
                                    .to_string(),
                            });
                        }
                        _ => warn!(index, "input delta for a block that is not tool_use"),
                    },
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(Block::ToolUse { id }) = self.blocks.remove(&index) {
                    events.push(StreamEvent::ToolCallEnd { id });
                }
            }
            "message_delta" => {
                if let Some(reason) = parsed["delta"]["stop_reason"].as_str() {
                    events.push(StreamEvent::MessageEnd {
                        stop_reason: stop_reason(reason),
                    });
                }
            }
            "error" => {
                let message = parsed["error"]["message"]
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| frame.data.clone());
                events.push(StreamEvent::Error { message });
            }
            "message_start" | "message_stop" | "ping" => {}
            other => trace!(event_type = other, "ignoring unknown SSE event type"),
        }
        events
    }
}

fn stop_reason(reason: &str) -> StopReason {
    match reason {
        "tool_use" => StopReason::ToolUse,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    }
}
