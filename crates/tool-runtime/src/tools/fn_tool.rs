//! Closure-backed tool for registering ad-hoc behaviour without a new type.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::tool::{Tool, ToolContext, ToolDefinition, ToolError};

type Executor = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;
type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

pub struct FnTool {
    definition: ToolDefinition,
    executor: Executor,
    predicate: Option<Predicate>,
}

impl FnTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        f: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            definition: ToolDefinition {
                name: name.into(),
                description: description.into(),
                input_schema,
            },
            executor: Arc::new(move |input| -> BoxFuture<'static, Result<Value, ToolError>> {
                Box::pin(f(input))
            }),
            predicate: None,
        }
    }

    /// Attach an approval predicate, evaluated against validated input.
    pub fn with_approval(mut self, predicate: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }
}

#[async_trait]
impl Tool for FnTool {
    fn definition(&self) -> ToolDefinition {
        self.definition.clone()
    }

    fn requires_approval(&self, input: &Value) -> bool {
        self.predicate.as_ref().is_some_and(|p| p(input))
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<Value, ToolError> {
        (self.executor)(input).await
    }
}
