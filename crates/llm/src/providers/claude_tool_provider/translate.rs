//! Translation from the part-based conversation model into Claude Messages
//! API payloads.
//!
//! Each step of an assistant message becomes an assistant turn with its
//! `tool_use` blocks, followed by a user turn carrying the matching
//! `tool_result` blocks.

use serde_json::{json, Value};

use dchat_tool_runtime::{
    conversation::{ConversationMessage, MessagePart, Role},
    tool::{ToolDefinition, ToolResultStatus},
};

/// Translate a [`ToolDefinition`] into the Claude API tool format.
pub(super) fn tool_definition_to_claude(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.input_schema,
    })
}

/// Request payload pieces: extra system text and the `messages` array.
#[derive(Debug, Default)]
pub(super) struct ClaudeMessages {
    pub system: Vec<String>,
    pub messages: Vec<Value>,
}

pub(super) fn messages_to_claude(messages: &[ConversationMessage]) -> ClaudeMessages {
    let mut out = ClaudeMessages::default();
    for message in messages {
        match message.role {
            Role::System => {
                let text = message.text();
                if !text.is_empty() {
                    out.system.push(text);
                }
            }
            Role::User => {
                let text = message.text();
                if !text.is_empty() {
                    push_turn(&mut out.messages, "user", vec![text_block(&text)]);
                }
            }
            Role::Assistant => assistant_to_claude(message, &mut out.messages),
        }
    }
    // The API wants the conversation to open with a user turn.
    while out
        .messages
        .first()
        .is_some_and(|m| m["role"] == "assistant")
    {
        out.messages.remove(0);
    }
    out
}

fn assistant_to_claude(message: &ConversationMessage, turns: &mut Vec<Value>) {
    for step in message.parts.split(|p| matches!(p, MessagePart::StepBoundary)) {
        let mut blocks = Vec::new();
        let mut results = Vec::new();
        for part in step {
            match part {
                MessagePart::Text { text } if !text.is_empty() => blocks.push(text_block(text)),
                MessagePart::ToolCall(call) => {
                    // Calls still waiting on a result are not sent.
                    let Some(result) = &call.result else { continue };
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.call.id,
                        "name": call.call.name,
                        "input": call.call.input,
                    }));
                    results.push(json!({
                        "type": "tool_result",
                        "tool_use_id": result.tool_call_id,
                        "content": result.output.to_string(),
                        "is_error": result.status != ToolResultStatus::Success,
                    }));
                }
                MessagePart::CollapsedToolCall {
                    tool_name, status, ..
                } => {
                    let outcome = match status {
                        Some(ToolResultStatus::Success) => "succeeded",
                        Some(ToolResultStatus::Error) => "failed",
                        Some(ToolResultStatus::Denied) => "was denied",
                        None => "did not finish",
                    };
                    blocks.push(text_block(&format!("[earlier call to {tool_name} {outcome}]")));
                }
                _ => {}
            }
        }
        if !blocks.is_empty() {
            push_turn(turns, "assistant", blocks);
        }
        if !results.is_empty() {
            push_turn(turns, "user", results);
        }
    }
}

fn text_block(text: &str) -> Value {
    json!({"type": "text", "text": text})
}

/// Append content blocks, merging into the previous turn when the role
/// repeats so roles keep alternating.
fn push_turn(turns: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if let Some(last) = turns.last_mut() {
        if last["role"] == role {
            if let Some(content) = last["content"].as_array_mut() {
                content.extend(blocks);
                return;
            }
        }
    }
    turns.push(json!({"role": role, "content": blocks}));
}
