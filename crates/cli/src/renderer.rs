//! Maps a tracked call to what the terminal shows for it.

use dchat_tool_runtime::{ToolCallState, ToolResultStatus, TrackedCall};
use serde_json::Value;

const MAX_OUTPUT_CHARS: usize = 500;

/// How a single tool call is presented.
#[derive(Debug, Clone, PartialEq)]
pub enum CallView {
    /// Arguments streaming, waiting to be gated, or running
    Progress { name: String, state: ToolCallState },
    /// Needs an operator decision
    AwaitingDecision { id: String, name: String, input: Value },
    Result { name: String, output: Value, is_error: bool },
    Denied { name: String, reason: String },
}

impl From<&TrackedCall> for CallView {
    fn from(call: &TrackedCall) -> Self {
        let name = call.name().to_string();
        match call.state {
            ToolCallState::ApprovalRequested => CallView::AwaitingDecision {
                id: call.id().to_string(),
                name,
                input: call.call.input.clone(),
            },
            ToolCallState::Rejected => CallView::Denied {
                name,
                reason: call
                    .result
                    .as_ref()
                    .and_then(|r| r.output["reason"].as_str())
                    .unwrap_or("denied")
                    .to_string(),
            },
            ToolCallState::OutputAvailable => match &call.result {
                Some(result) => CallView::Result {
                    name,
                    output: result.output.clone(),
                    is_error: result.status != ToolResultStatus::Success,
                },
                None => CallView::Progress {
                    name,
                    state: call.state,
                },
            },
            state => CallView::Progress { name, state },
        }
    }
}

impl CallView {
    /// One-line summary for the terminal.
    pub fn summary(&self) -> String {
        match self {
            CallView::Progress { name, state } => {
                let what = match state {
                    ToolCallState::InputStreaming => "preparing",
                    ToolCallState::Approved => "approved, running",
                    _ => "running",
                };
                format!("[{name}] {what}...")
            }
            CallView::AwaitingDecision { name, input, .. } => {
                format!("[{name}] wants to run with {}", truncate(&input.to_string()))
            }
            CallView::Result {
                name,
                output,
                is_error: false,
            } => format!("[{name} result]: {}", truncate(&output.to_string())),
            CallView::Result {
                name,
                output,
                is_error: true,
            } => {
                let reason = output["error"]
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| output.to_string());
                format!("[{name} error]: {}", truncate(&reason))
            }
            CallView::Denied { name, reason } => format!("[{name} denied]: {reason}"),
        }
    }
}

/// Truncate long text for display, on a char boundary.
fn truncate(text: &str) -> String {
    let total = text.chars().count();
    if total > MAX_OUTPUT_CHARS {
        let head: String = text.chars().take(MAX_OUTPUT_CHARS).collect();
        format!("{head}... ({total} chars total)")
    } else {
        text.to_string()
    }
}
