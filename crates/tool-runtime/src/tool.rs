use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Describes a tool's interface for LLM consumption.
/// Maps to Claude's tool format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name (e.g., "calculate", "get_weather")
    pub name: String,
    /// Human-readable description for the LLM
    pub description: String,
    /// JSON Schema describing the expected input
    pub input_schema: Value,
}

/// Represents an LLM requesting execution of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this invocation (used to match results)
    pub id: String,
    /// Tool name to execute
    pub name: String,
    /// JSON input arguments
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultStatus {
    Success,
    Error,
    /// The operator (or policy) refused the call; the tool never ran.
    Denied,
}

/// Result of a tool call, folded back into the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Must match the ToolCall id
    pub tool_call_id: String,
    /// Structured payload shown to the model
    pub output: Value,
    pub status: ToolResultStatus,
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, output: Value) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            output,
            status: ToolResultStatus::Success,
        }
    }

    /// Structured `{"error": reason}` payload.
    pub fn error(tool_call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            output: json!({ "error": reason.into() }),
            status: ToolResultStatus::Error,
        }
    }

    /// Synthetic marker for a call that was refused and never executed.
    pub fn denied(tool_call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            output: json!({ "denied": true, "reason": reason.into() }),
            status: ToolResultStatus::Denied,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status != ToolResultStatus::Success
    }

    pub fn is_denied(&self) -> bool {
        self.status == ToolResultStatus::Denied
    }
}

/// Context passed to tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// Id of the call being executed; tools with side effects use it as an
    /// idempotency key.
    pub tool_call_id: String,
}

/// The primary extension point: all tools implement this trait.
///
/// A tool bundles the three capabilities the runtime needs from it:
/// input validation, the approval predicate, and execution. Tools are
/// object-safe, Send + Sync, and async.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool's definition (name, description, JSON Schema).
    fn definition(&self) -> ToolDefinition;

    /// Check the input before anything else looks at it.
    /// Defaults to validating against `definition().input_schema`.
    fn validate(&self, input: &Value) -> Result<(), ToolError> {
        validate_against_schema(&self.definition().input_schema, input)
    }

    /// Approval predicate, evaluated on validated input. Must be a pure
    /// function of `input`.
    fn requires_approval(&self, _input: &Value) -> bool {
        false
    }

    /// Execute the tool with the given (validated) JSON input.
    async fn execute(&self, input: Value, context: &ToolContext) -> Result<Value, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    ExecutionFailed(String),
    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl fmt::Display for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.description)
    }
}

/// Validate a JSON value against a JSON Schema, reporting every violation.
pub fn validate_against_schema(schema: &Value, input: &Value) -> Result<(), ToolError> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|e| ToolError::ExecutionFailed(format!("invalid tool schema: {e}")))?;
    if let Err(errors) = compiled.validate(input) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(ToolError::InvalidInput(messages.join("; ")));
    }
    Ok(())
}

/// Simple echo tool for testing purposes.
#[cfg(any(test, feature = "test-utils"))]
pub struct EchoTool;

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            description: "Echoes back the input message. For testing.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The message to echo back"
                    }
                },
                "required": ["message"]
            }),
        }
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<Value, ToolError> {
        let message = input
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing 'message' field".to_string()))?;

        Ok(json!({ "message": message }))
    }
}
