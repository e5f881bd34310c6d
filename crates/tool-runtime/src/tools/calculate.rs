//! Arithmetic tool. Calls with a large operand need operator approval.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolContext, ToolDefinition, ToolError};

/// Operands above this magnitude require approval.
pub const APPROVAL_THRESHOLD: f64 = 1000.0;

// Integral results inside this range are emitted as JSON integers.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Operator {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Subtract,
    #[serde(rename = "*")]
    Multiply,
    #[serde(rename = "/")]
    Divide,
    #[serde(rename = "%")]
    Remainder,
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Remainder => "%",
        }
    }
}

#[derive(Debug, Deserialize)]
struct CalculateArgs {
    a: f64,
    b: f64,
    operator: Operator,
}

/// Apply `op` to the operands, refusing results that are not finite.
pub fn evaluate(a: f64, b: f64, op: Operator) -> Result<f64, ToolError> {
    let result = match op {
        Operator::Add => a + b,
        Operator::Subtract => a - b,
        Operator::Multiply => a * b,
        Operator::Divide | Operator::Remainder if b == 0.0 => {
            return Err(ToolError::ExecutionFailed("Division by zero".to_string()))
        }
        Operator::Divide => a / b,
        Operator::Remainder => a % b,
    };
    if !result.is_finite() {
        return Err(ToolError::ExecutionFailed(
            "Result is not a finite number".to_string(),
        ));
    }
    Ok(result)
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < MAX_EXACT_INTEGER {
        json!(value as i64)
    } else {
        json!(value)
    }
}

fn exceeds_threshold(input: &Value, key: &str) -> bool {
    input
        .get(key)
        .and_then(Value::as_f64)
        .is_some_and(|n| n.abs() > APPROVAL_THRESHOLD)
}

pub struct CalculateTool;

#[async_trait]
impl Tool for CalculateTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "calculate".to_string(),
            description: "Perform a basic arithmetic operation on two numbers. \
                          Operations on numbers larger than 1000 need operator approval."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "a": {
                        "type": "number",
                        "description": "First operand"
                    },
                    "b": {
                        "type": "number",
                        "description": "Second operand"
                    },
                    "operator": {
                        "type": "string",
                        "enum": ["+", "-", "*", "/", "%"],
                        "description": "Arithmetic operator"
                    }
                },
                "required": ["a", "b", "operator"]
            }),
        }
    }

    fn requires_approval(&self, input: &Value) -> bool {
        exceeds_threshold(input, "a") || exceeds_threshold(input, "b")
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<Value, ToolError> {
        let args: CalculateArgs =
            serde_json::from_value(input).map_err(|e| ToolError::InvalidInput(e.to_string()))?;
        let expression = format!("{} {} {}", args.a, args.operator.symbol(), args.b);
        debug!(%expression, "calculating");

        let result = evaluate(args.a, args.b, args.operator)?;
        Ok(json!({
            "expression": expression,
            "result": number(result),
        }))
    }
}
