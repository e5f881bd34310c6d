use crate::conversation::ConversationMessage;
use crate::stream::StreamEvent;
use crate::tool::ToolDefinition;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Events of one model step, in arrival order.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// Model backend seen by the turn runner.
///
/// Defined here, by the consumer, rather than next to the implementations
/// in `dchat-llm`.
#[async_trait]
pub trait ToolAwareLlmProvider: Send + Sync {
    /// Start one model step over `messages` with `tools` available.
    async fn stream_with_tools(
        &self,
        messages: Vec<ConversationMessage>,
        system_prompt: Option<String>,
        tools: Vec<ToolDefinition>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<EventStream, LlmError>;

    /// Provider name for logging/debugging (e.g., "claude", "mock")
    fn provider_name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("Authentication failed")]
    AuthError,
    #[error("Stream error: {0}")]
    StreamError(String),
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Mock LLM provider for testing the agentic loop without real API calls.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use crate::stream::StopReason;
    use futures::stream;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Scripted {
        Events(Vec<StreamEvent>),
        Fail(String),
    }

    /// What the provider was asked for on one call.
    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        pub messages: Vec<ConversationMessage>,
        pub system_prompt: Option<String>,
        pub tools: Vec<ToolDefinition>,
    }

    /// A mock provider that replays scripted steps in the order they were
    /// queued and records every request.
    pub struct MockLlmProvider {
        responses: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<RecordedRequest>>,
    }

    impl MockLlmProvider {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Queue a response for a later call.
        pub fn queue_response(&self, events: Vec<StreamEvent>) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Scripted::Events(events));
        }

        /// Queue a simple text response.
        pub fn queue_text(&self, text: &str) {
            self.queue_response(vec![
                StreamEvent::TextDelta {
                    text: text.to_string(),
                },
                StreamEvent::MessageEnd {
                    stop_reason: StopReason::EndTurn,
                },
            ]);
        }

        /// Queue a step that proposes the given `(id, name, input)` calls.
        pub fn queue_tool_calls(&self, calls: &[(&str, &str, Value)]) {
            let mut events = Vec::new();
            for (id, name, input) in calls {
                events.push(StreamEvent::ToolCallStart {
                    id: id.to_string(),
                    name: name.to_string(),
                });
                events.push(StreamEvent::ToolCallDelta {
                    id: id.to_string(),
                    arguments_delta: input.to_string(),
                });
                events.push(StreamEvent::ToolCallEnd { id: id.to_string() });
            }
            events.push(StreamEvent::MessageEnd {
                stop_reason: StopReason::ToolUse,
            });
            self.queue_response(events);
        }

        /// Make a later call fail before any event is streamed.
        pub fn queue_failure(&self, message: &str) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Scripted::Fail(message.to_string()));
        }

        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl Default for MockLlmProvider {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ToolAwareLlmProvider for MockLlmProvider {
        async fn stream_with_tools(
            &self,
            messages: Vec<ConversationMessage>,
            system_prompt: Option<String>,
            tools: Vec<ToolDefinition>,
            _temperature: f32,
            _max_tokens: u32,
        ) -> Result<EventStream, LlmError> {
            self.requests.lock().unwrap().push(RecordedRequest {
                messages,
                system_prompt,
                tools,
            });
            let next = self.responses.lock().unwrap().pop_front();
            let events = match next {
                Some(Scripted::Events(events)) => events,
                Some(Scripted::Fail(message)) => return Err(LlmError::NetworkError(message)),
                None => vec![StreamEvent::MessageEnd {
                    stop_reason: StopReason::EndTurn,
                }],
            };
            Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
        }

        fn provider_name(&self) -> &str {
            "mock"
        }
    }
}
