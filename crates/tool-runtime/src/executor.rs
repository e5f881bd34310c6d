//! Runs cleared tool calls and turns every failure into a structured result.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::approval::{ApprovalGate, ApprovalPolicy, GateDecision};
use crate::registry::{RegistryError, ToolRegistry};
use crate::tool::{ToolCall, ToolContext, ToolError, ToolResult};

#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    gate: ApprovalGate,
    timeout: Option<Duration>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, policy: ApprovalPolicy) -> Self {
        let gate = ApprovalGate::new(registry.clone(), policy);
        Self {
            registry,
            gate,
            timeout: None,
        }
    }

    /// Give up waiting on a tool after `timeout`. The tool task itself keeps
    /// running to completion; only its result is discarded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    /// Lookup, validation and gating for a freshly proposed call.
    pub fn prepare(&self, call: &ToolCall) -> Result<GateDecision, ToolError> {
        let tool = self.registry.lookup(&call.name).map_err(|e| match e {
            RegistryError::UnknownTool(name) => ToolError::UnknownTool(name),
            other => ToolError::ExecutionFailed(other.to_string()),
        })?;
        tool.validate(&call.input)?;
        Ok(crate::approval::decide(
            tool.as_ref(),
            self.gate.policy().level_for(&call.name),
            &call.input,
        ))
    }

    /// Execute a call. Never fails: unknown tools, invalid input, tool
    /// errors and panics all come back as `{"error": ...}` results.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let tool = match self.registry.get(&call.name) {
            Some(tool) => tool,
            None => {
                return ToolResult::error(
                    &call.id,
                    ToolError::UnknownTool(call.name.clone()).to_string(),
                )
            }
        };
        if let Err(e) = tool.validate(&call.input) {
            return ToolResult::error(&call.id, e.to_string());
        }

        debug!(tool = %call.name, id = %call.id, "executing tool");
        let context = ToolContext {
            tool_call_id: call.id.clone(),
        };
        let input = call.input.clone();
        // Spawned so the tool finishes even if this future is dropped.
        let handle = tokio::spawn(async move { tool.execute(input, &context).await });

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(tool = %call.name, id = %call.id, ?limit, "tool timed out");
                    return ToolResult::error(&call.id, ToolError::Timeout(limit).to_string());
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(output)) => ToolResult::success(&call.id, output),
            Ok(Err(e)) => {
                warn!(tool = %call.name, id = %call.id, error = %e, "tool failed");
                ToolResult::error(&call.id, e.to_string())
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                warn!(tool = %call.name, id = %call.id, panic = %message, "tool panicked");
                ToolResult::error(&call.id, format!("Tool panicked: {message}"))
            }
            Err(_) => ToolResult::error(&call.id, "Tool task was cancelled"),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
