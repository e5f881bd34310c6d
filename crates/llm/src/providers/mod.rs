pub mod claude_tool_provider;

use std::sync::Arc;

use dchat_core::config::LlmConfig;
use dchat_tool_runtime::provider::{LlmError, ToolAwareLlmProvider};
use tracing::info;

use self::claude_tool_provider::ClaudeToolProvider;

/// Create the tool-aware provider selected by config.
pub fn create_tool_provider(config: &LlmConfig) -> Result<Arc<dyn ToolAwareLlmProvider>, LlmError> {
    match config.provider.as_str() {
        "anthropic" | "claude" => {
            let api_key = config
                .anthropic_api_key
                .as_ref()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| LlmError::NotConfigured("ANTHROPIC_API_KEY not set".into()))?;
            info!(model = %config.anthropic_model, "using Claude provider");
            Ok(Arc::new(ClaudeToolProvider::new(
                api_key.clone(),
                config.anthropic_model.clone(),
                config.anthropic_base_url.clone(),
            )))
        }
        other => Err(LlmError::NotConfigured(format!(
            "unknown LLM provider: '{}'",
            other
        ))),
    }
}
