//! Per-turn streaming status. One session lives for one user turn.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Idle,
    Streaming,
    AwaitingApproval,
    Error,
    Done,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Done)
    }

    /// Whether the host should be kept alive in this status. A turn parked
    /// on an operator decision does not hold the host.
    pub fn is_active(self) -> bool {
        self == Self::Streaming
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::AwaitingApproval => "awaiting-approval",
            Self::Error => "error",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("step limit of {0} reached")]
    StepLimit(u32),
    #[error("session already finished ({0})")]
    Finished(SessionStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingSession {
    pub status: SessionStatus,
    pub step_count: u32,
    pub max_steps: u32,
}

impl StreamingSession {
    pub fn new(max_steps: u32) -> Self {
        Self {
            status: SessionStatus::Idle,
            step_count: 0,
            max_steps: max_steps.max(1),
        }
    }

    fn set(&mut self, status: SessionStatus) {
        if self.status != status {
            debug!(from = %self.status, to = %status, step = self.step_count, "session status");
            self.status = status;
        }
    }

    /// Start the next model step. `step_count` never passes `max_steps`.
    pub fn begin_step(&mut self) -> Result<u32, SessionError> {
        if self.status.is_terminal() {
            return Err(SessionError::Finished(self.status));
        }
        if self.step_count >= self.max_steps {
            return Err(SessionError::StepLimit(self.max_steps));
        }
        self.step_count += 1;
        self.set(SessionStatus::Streaming);
        Ok(self.step_count)
    }

    pub fn await_approval(&mut self) {
        if !self.status.is_terminal() {
            self.set(SessionStatus::AwaitingApproval);
        }
    }

    pub fn resume(&mut self) {
        if self.status == SessionStatus::AwaitingApproval {
            self.set(SessionStatus::Streaming);
        }
    }

    pub fn finish(&mut self) {
        info!(steps = self.step_count, "turn finished");
        self.set(SessionStatus::Done);
    }

    pub fn fail(&mut self, reason: &str) {
        warn!(steps = self.step_count, reason, "turn failed");
        self.set(SessionStatus::Error);
    }
}
