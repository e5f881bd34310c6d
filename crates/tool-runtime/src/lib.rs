pub mod approval;
pub mod call;
pub mod conversation;
pub mod executor;
pub mod keepalive;
pub mod provider;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod stream;
pub mod tool;
pub mod tools;

pub use approval::{ApprovalDecision, ApprovalError, ApprovalGate, ApprovalPolicy, GateDecision, PolicyLevel};
pub use call::{StepCalls, ToolCallState, TrackedCall, TransitionError};
pub use conversation::{
    fold_results, next_step, prune_messages, Conversation, ConversationMessage, FinishReason,
    MessagePart, RetentionPolicy, Role, StepDecision,
};
pub use executor::ToolExecutor;
pub use keepalive::{KeepAlive, KeepAliveTicker, NoopKeepAlive};
pub use provider::{EventStream, LlmError, ToolAwareLlmProvider};
pub use registry::{RegistryError, ToolRegistry};
pub use runtime::{AgenticLoop, ApprovalSender, TurnError, TurnEvent, TurnHandle, TurnOutcome};
pub use session::{SessionStatus, StreamingSession};
pub use stream::{StopReason, StreamEvent};
pub use tool::{Tool, ToolCall, ToolContext, ToolDefinition, ToolError, ToolResult, ToolResultStatus};
pub use tools::{CalculateTool, FnTool, LocalTimeTool, OpenMeteoClient, WeatherTool};

use dchat_core::config::ToolsConfig;

/// Registry with the built-in tools: `calculate`, `get_weather` and
/// `get_local_time`.
pub fn builtin_registry(config: &ToolsConfig) -> Result<ToolRegistry, RegistryError> {
    let client = OpenMeteoClient::from_config(config);
    let mut registry = ToolRegistry::new();
    registry.register(CalculateTool)?;
    registry.register(WeatherTool::new(client.clone()))?;
    registry.register(LocalTimeTool::new(client))?;
    Ok(registry)
}
