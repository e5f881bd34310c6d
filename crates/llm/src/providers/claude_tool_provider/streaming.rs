//! [`ToolAwareLlmProvider`] trait implementation for the Claude streaming API.

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::{debug, warn};

use dchat_tool_runtime::{
    conversation::ConversationMessage,
    provider::{EventStream, LlmError, ToolAwareLlmProvider},
    stream::StreamEvent,
    tool::ToolDefinition,
};

use super::sse::{BlockTracker, SseDecoder};
use super::translate::{messages_to_claude, tool_definition_to_claude};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

/// Claude (Anthropic) provider with streaming tool-use support.
///
/// Uses the Anthropic Messages API (`/v1/messages`) with `stream: true` to emit
/// incremental [`StreamEvent`]s that the agentic loop can consume.
pub struct ClaudeToolProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl ClaudeToolProvider {
    /// Create a new Claude tool provider.
    ///
    /// # Arguments
    /// * `api_key` - Anthropic API key
    /// * `model` - Model name (e.g. `"claude-sonnet-4-20250514"`)
    /// * `base_url` - API base URL (e.g. `"https://api.anthropic.com"`)
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(
        &self,
        messages: &[ConversationMessage],
        system_prompt: Option<String>,
        tools: &[ToolDefinition],
        temperature: f32,
        max_tokens: u32,
    ) -> Value {
        let translated = messages_to_claude(messages);
        let api_tools: Vec<Value> = tools.iter().map(tool_definition_to_claude).collect();

        let mut body = json!({
            "model": self.model,
            "messages": translated.messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": true,
        });

        if !api_tools.is_empty() {
            body["tools"] = json!(api_tools);
        }

        let system: Vec<String> = system_prompt.into_iter().chain(translated.system).collect();
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        body
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

struct State {
    bytes: ByteStream,
    decoder: SseDecoder,
    tracker: BlockTracker,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

/// Turn an SSE byte stream into [`StreamEvent`]s, preserving arrival order.
pub(super) fn decode_events(bytes: ByteStream) -> EventStream {
    let state = State {
        bytes,
        decoder: SseDecoder::new(),
        tracker: BlockTracker::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    let events = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for frame in state.decoder.push(&chunk) {
                        let events = state.tracker.translate(&frame);
                        state.pending.extend(events);
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(LlmError::StreamError(e.to_string())), state));
                }
                None => {
                    state.finished = true;
                    if let Some(frame) = state.decoder.finish() {
                        let events = state.tracker.translate(&frame);
                        state.pending.extend(events);
                    }
                }
            }
        }
    });
    Box::pin(events)
}

fn retry_after(headers: &reqwest::header::HeaderMap, body: &str) -> u64 {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| {
            serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v["error"]["retry_after_secs"].as_u64())
        })
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

#[async_trait]
impl ToolAwareLlmProvider for ClaudeToolProvider {
    async fn stream_with_tools(
        &self,
        messages: Vec<ConversationMessage>,
        system_prompt: Option<String>,
        tools: Vec<ToolDefinition>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<EventStream, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.request_body(&messages, system_prompt, &tools, temperature, max_tokens);

        debug!(model = %self.model, url = %url, messages = messages.len(), "starting Claude streaming request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body_text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Claude request rejected");
            return Err(match status.as_u16() {
                401 => LlmError::AuthError,
                429 => LlmError::RateLimited {
                    retry_after_secs: retry_after(&headers, &body_text),
                },
                code => LlmError::ApiError {
                    status: code,
                    message: body_text,
                },
            });
        }

        Ok(decode_events(Box::pin(response.bytes_stream())))
    }

    fn provider_name(&self) -> &str {
        "claude"
    }
}
