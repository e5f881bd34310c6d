use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::call::{ToolCallState, TrackedCall};
use crate::session::StreamingSession;
use crate::tool::{ToolResult, ToolResultStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One ordered piece of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    /// Model reasoning; dropped from older messages by the retention policy
    Reasoning {
        text: String,
    },
    ToolCall(TrackedCall),
    /// What remains of a tool call once its detail has aged out
    CollapsedToolCall {
        tool_call_id: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ToolResultStatus>,
    },
    /// Separates the model steps of a single assistant turn
    StepBoundary,
}

/// A message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(role: Role, parts: Vec<MessagePart>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            parts,
            created_at: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessagePart::Text { text: text.into() }])
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![MessagePart::Text { text: text.into() }])
    }

    /// An empty assistant message, filled in as the turn streams.
    pub fn assistant() -> Self {
        Self::new(Role::Assistant, Vec::new())
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Append streamed text, extending the trailing text part if there is one.
    pub fn push_text(&mut self, delta: &str) {
        if let Some(MessagePart::Text { text }) = self.parts.last_mut() {
            text.push_str(delta);
        } else {
            self.parts.push(MessagePart::Text {
                text: delta.to_string(),
            });
        }
    }

    pub fn push_reasoning(&mut self, delta: &str) {
        if let Some(MessagePart::Reasoning { text }) = self.parts.last_mut() {
            text.push_str(delta);
        } else {
            self.parts.push(MessagePart::Reasoning {
                text: delta.to_string(),
            });
        }
    }

    pub fn push_step_boundary(&mut self) {
        self.parts.push(MessagePart::StepBoundary);
    }

    /// Replace the tool-call part with the same id, or append a new one.
    pub fn upsert_tool_call(&mut self, call: TrackedCall) {
        match self.tool_call_mut(call.id()) {
            Some(existing) => *existing = call,
            None => self.parts.push(MessagePart::ToolCall(call)),
        }
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &TrackedCall> {
        self.parts.iter().filter_map(|p| match p {
            MessagePart::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn tool_call_mut(&mut self, id: &str) -> Option<&mut TrackedCall> {
        self.parts.iter_mut().find_map(|p| match p {
            MessagePart::ToolCall(call) if call.id() == id => Some(call),
            _ => None,
        })
    }

    /// Approximate token count using character count / 4 heuristic.
    pub fn approximate_tokens(&self) -> usize {
        let chars: usize = self
            .parts
            .iter()
            .map(|p| match p {
                MessagePart::Text { text } | MessagePart::Reasoning { text } => text.len(),
                MessagePart::ToolCall(call) => {
                    call.name().len()
                        + call.call.input.to_string().len()
                        + call.result.as_ref().map_or(0, |r| r.output.to_string().len())
                }
                MessagePart::CollapsedToolCall { tool_name, .. } => tool_name.len() + 16,
                MessagePart::StepBoundary => 0,
            })
            .sum();
        chars / 4
    }
}

/// How much detail older messages keep when sent back to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Newest messages whose tool calls are kept verbatim
    pub tool_call_messages: usize,
    /// Newest messages whose reasoning is kept
    pub reasoning_messages: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            tool_call_messages: 2,
            reasoning_messages: 1,
        }
    }
}

/// Collapse aged-out tool calls to markers and drop aged-out reasoning.
/// Never reorders the parts that remain.
pub fn prune_messages(
    messages: &[ConversationMessage],
    policy: &RetentionPolicy,
) -> Vec<ConversationMessage> {
    let total = messages.len();
    messages
        .iter()
        .enumerate()
        .map(|(index, message)| {
            let age = total - 1 - index;
            let keep_calls = age < policy.tool_call_messages;
            let keep_reasoning = age < policy.reasoning_messages;
            let parts = message
                .parts
                .iter()
                .filter_map(|part| match part {
                    MessagePart::Reasoning { .. } if !keep_reasoning => None,
                    MessagePart::ToolCall(call) if !keep_calls => {
                        Some(MessagePart::CollapsedToolCall {
                            tool_call_id: call.id().to_string(),
                            tool_name: call.name().to_string(),
                            status: call.result.as_ref().map(|r| r.status),
                        })
                    }
                    other => Some(other.clone()),
                })
                .collect();
            ConversationMessage {
                parts,
                ..message.clone()
            }
        })
        .collect()
}

/// Attach results to their tool-call parts through the call state machine.
/// Denials reject the call; pre-execution errors fail it. Results for ids
/// that are absent or already settled are skipped. Returns how many were
/// folded.
pub fn fold_results(message: &mut ConversationMessage, results: &[ToolResult]) -> usize {
    let mut folded = 0;
    for result in results {
        let Some(call) = message.tool_call_mut(&result.tool_call_id) else {
            warn!(id = %result.tool_call_id, "result for unknown tool call");
            continue;
        };
        let outcome = if result.is_denied() {
            let reason = result.output["reason"].as_str().unwrap_or("denied").to_string();
            call.reject(reason)
        } else if call.state == ToolCallState::InputAvailable && !call.may_execute() {
            call.fail(result.clone())
        } else {
            call.complete(result.clone())
        };
        match outcome {
            Ok(()) => folded += 1,
            Err(e) => debug!(error = %e, "result not folded"),
        }
    }
    folded
}

/// Why a turn ended. Both are normal terminations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model answered without proposing tool calls
    Completed,
    /// `max_steps` model steps were taken
    StepLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Continue,
    Finish(FinishReason),
}

/// Decide whether the turn gets another model step after a step that
/// proposed `proposed_calls` calls.
pub fn next_step(proposed_calls: usize, session: &StreamingSession) -> StepDecision {
    if proposed_calls == 0 {
        StepDecision::Finish(FinishReason::Completed)
    } else if session.step_count >= session.max_steps {
        StepDecision::Finish(FinishReason::StepLimit)
    } else {
        StepDecision::Continue
    }
}

/// Manages conversation history with context window awareness.
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: Vec<ConversationMessage>,
    /// Maximum approximate token count of a model input
    max_tokens: usize,
    /// System prompt (always retained)
    system_prompt: Option<String>,
    retention: RetentionPolicy,
}

impl Conversation {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_tokens,
            system_prompt: None,
            retention: RetentionPolicy::default(),
        }
    }

    pub fn from_messages(messages: Vec<ConversationMessage>, max_tokens: usize) -> Self {
        Self {
            messages,
            ..Self::new(max_tokens)
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    pub fn push(&mut self, message: ConversationMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<ConversationMessage> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn approximate_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.approximate_tokens()).sum()
    }

    /// Build what the model sees next: the history plus the in-flight
    /// assistant message with `pending` folded in, pruned by the retention
    /// policy and trimmed oldest-first to the token budget. The stored
    /// history is not modified.
    pub fn next_model_input(
        &self,
        in_flight: Option<&ConversationMessage>,
        pending: &[ToolResult],
    ) -> Vec<ConversationMessage> {
        let mut messages = self.messages.clone();
        if let Some(current) = in_flight {
            let mut current = current.clone();
            fold_results(&mut current, pending);
            messages.push(current);
        }

        let mut pruned = prune_messages(&messages, &self.retention);
        let mut tokens: usize = pruned.iter().map(|m| m.approximate_tokens()).sum();
        // Keep at least the last 2 messages (current turn)
        while tokens > self.max_tokens && pruned.len() > 2 {
            let dropped = pruned.remove(0);
            tokens -= dropped.approximate_tokens();
        }
        debug!(messages = pruned.len(), tokens, "assembled model input");
        pruned
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new(100_000)
    }
}
