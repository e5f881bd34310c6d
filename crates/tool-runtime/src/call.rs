//! Tool-call life cycle.
//!
//! ```text
//! input-streaming ─▶ input-available ─┬─(gate: proceed)──────────────▶ output-available
//!                                     ├─(gate: approval)─▶ approval-requested
//!                                     │                     ├─ approve ─▶ approved ─▶ output-available
//!                                     │                     └─ reject ──▶ rejected
//!                                     └─(unknown tool / invalid input) ▶ output-available (error)
//! ```
//!
//! A call can only reach `output-available` through a cleared gate or an
//! approval, and a rejected call carries a denial marker instead of output.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::approval::ApprovalError;
use crate::tool::{ToolCall, ToolResult, ToolResultStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolCallState {
    InputStreaming,
    InputAvailable,
    ApprovalRequested,
    Approved,
    Rejected,
    OutputAvailable,
}

impl ToolCallState {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Rejected | Self::OutputAvailable)
    }
}

impl fmt::Display for ToolCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InputStreaming => "input-streaming",
            Self::InputAvailable => "input-available",
            Self::ApprovalRequested => "approval-requested",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::OutputAvailable => "output-available",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("tool call {id}: cannot {action} while {from}")]
pub struct TransitionError {
    pub id: String,
    pub from: ToolCallState,
    pub action: &'static str,
}

/// A model-proposed call together with its position in the life cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedCall {
    pub call: ToolCall,
    pub state: ToolCallState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,
    /// Set once the gate let the call through without an approval.
    #[serde(skip)]
    cleared: bool,
}

impl TrackedCall {
    /// A call whose arguments are still arriving.
    pub fn streaming(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            call: ToolCall {
                id: id.into(),
                name: name.into(),
                input: Value::Null,
            },
            state: ToolCallState::InputStreaming,
            result: None,
            cleared: false,
        }
    }

    /// A call whose arguments are already complete.
    pub fn available(call: ToolCall) -> Self {
        Self {
            call,
            state: ToolCallState::InputAvailable,
            result: None,
            cleared: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.call.id
    }

    pub fn name(&self) -> &str {
        &self.call.name
    }

    fn guard(&self, allowed: bool, action: &'static str) -> Result<(), TransitionError> {
        if allowed {
            Ok(())
        } else {
            Err(TransitionError {
                id: self.call.id.clone(),
                from: self.state,
                action,
            })
        }
    }

    pub fn mark_input_available(&mut self, input: Value) -> Result<(), TransitionError> {
        self.guard(self.state == ToolCallState::InputStreaming, "finish input")?;
        self.call.input = input;
        self.state = ToolCallState::InputAvailable;
        Ok(())
    }

    /// Apply the gate's verdict: either clear the call for execution or
    /// move it to `approval-requested`.
    pub fn gate(&mut self, requires_approval: bool) -> Result<(), TransitionError> {
        self.guard(
            self.state == ToolCallState::InputAvailable && !self.cleared,
            "gate",
        )?;
        if requires_approval {
            self.state = ToolCallState::ApprovalRequested;
        } else {
            self.cleared = true;
        }
        Ok(())
    }

    pub fn approve(&mut self) -> Result<(), TransitionError> {
        self.guard(self.state == ToolCallState::ApprovalRequested, "approve")?;
        self.state = ToolCallState::Approved;
        Ok(())
    }

    /// Reject the call; the denial marker becomes its result.
    pub fn reject(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.guard(
            self.state == ToolCallState::ApprovalRequested
                || (self.state == ToolCallState::InputAvailable && !self.cleared),
            "reject",
        )?;
        self.result = Some(ToolResult::denied(self.call.id.clone(), reason));
        self.state = ToolCallState::Rejected;
        Ok(())
    }

    /// Whether `complete` would be accepted now.
    pub fn may_execute(&self) -> bool {
        self.state == ToolCallState::Approved
            || (self.state == ToolCallState::InputAvailable && self.cleared)
    }

    /// Record the executor's result.
    pub fn complete(&mut self, result: ToolResult) -> Result<(), TransitionError> {
        self.guard(self.may_execute(), "complete")?;
        self.result = Some(result);
        self.state = ToolCallState::OutputAvailable;
        Ok(())
    }

    /// Settle a call that never reached the executor (unknown tool,
    /// invalid input). Only error results are accepted.
    pub fn fail(&mut self, result: ToolResult) -> Result<(), TransitionError> {
        self.guard(
            self.state == ToolCallState::InputAvailable
                && !self.cleared
                && result.status == ToolResultStatus::Error,
            "fail",
        )?;
        self.result = Some(result);
        self.state = ToolCallState::OutputAvailable;
        Ok(())
    }
}

/// The calls proposed in one model step, in proposal order.
#[derive(Debug, Clone, Default)]
pub struct StepCalls {
    calls: Vec<TrackedCall>,
}

impl StepCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a call. Returns false, leaving the step untouched, when a call
    /// with the same id is already tracked.
    pub fn push(&mut self, call: TrackedCall) -> bool {
        if self.get(call.id()).is_some() {
            return false;
        }
        self.calls.push(call);
        true
    }

    pub fn get(&self, id: &str) -> Option<&TrackedCall> {
        self.calls.iter().find(|c| c.id() == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TrackedCall> {
        self.calls.iter_mut().find(|c| c.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedCall> {
        self.calls.iter()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn awaiting_approval(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| c.state == ToolCallState::ApprovalRequested)
            .count()
    }

    pub fn all_settled(&self) -> bool {
        self.calls.iter().all(|c| c.state.is_settled())
    }

    /// Apply an operator decision. Fails without touching any call unless
    /// `id` is currently in `approval-requested`.
    pub fn resolve_approval(
        &mut self,
        id: &str,
        approved: bool,
    ) -> Result<&TrackedCall, ApprovalError> {
        let call = self
            .calls
            .iter_mut()
            .find(|c| c.id() == id && c.state == ToolCallState::ApprovalRequested)
            .ok_or_else(|| ApprovalError::UnknownCall(id.to_string()))?;
        let outcome = if approved {
            call.approve()
        } else {
            call.reject("Tool call was denied by the operator")
        };
        // the state was checked above
        debug_assert!(outcome.is_ok());
        Ok(call)
    }

    pub fn into_vec(self) -> Vec<TrackedCall> {
        self.calls
    }
}
