use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DchatError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `DCHAT_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("DCHAT_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            llm: LlmConfig::from_env_profiled(p),
            agent: AgentConfig::from_env_profiled(p),
            tools: ToolsConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings the turn runner cannot work with.
    pub fn validate(&self) -> Result<(), DchatError> {
        if self.agent.max_steps == 0 {
            return Err(DchatError::Config("AGENT_MAX_STEPS must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.llm.temperature) {
            return Err(DchatError::Config(format!(
                "LLM_TEMPERATURE must be within 0.0..=1.0, got {}",
                self.llm.temperature
            )));
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  llm:    provider={}, model={}, key={}",
            self.llm.provider,
            self.llm.anthropic_model,
            if self.llm.is_configured() { "set" } else { "(none)" }
        );
        tracing::info!(
            "  agent:  max_steps={}, approval_timeout={:?}, keepalive={}s",
            self.agent.max_steps,
            self.agent.approval_timeout(),
            self.agent.keepalive_interval_secs
        );
        tracing::info!("  tools:  geocoding={}", self.tools.geocoding_url);
    }

    /// Return a redacted view safe for display (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "llm": {
                "provider": self.llm.provider,
                "model": self.llm.anthropic_model,
                "configured": self.llm.is_configured(),
            },
            "agent": {
                "max_steps": self.agent.max_steps,
                "approval_timeout_secs": self.agent.approval_timeout_secs,
            },
        })
    }
}

// ── LLM (Anthropic) ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "anthropic" (alias "claude")
    pub provider: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub anthropic_base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LlmConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            provider: profiled_env_or(p, "LLM_PROVIDER", "anthropic"),
            anthropic_api_key: profiled_env_opt(p, "ANTHROPIC_API_KEY"),
            anthropic_model: profiled_env_or(p, "ANTHROPIC_MODEL", "claude-sonnet-4-5-20250929"),
            anthropic_base_url: profiled_env_or(p, "ANTHROPIC_BASE_URL", "https://api.anthropic.com"),
            temperature: profiled_env_or(p, "LLM_TEMPERATURE", "0.1")
                .parse()
                .unwrap_or(0.1),
            max_tokens: profiled_env_u32(p, "LLM_MAX_TOKENS", 4096),
        }
    }

    pub fn is_configured(&self) -> bool {
        match self.provider.as_str() {
            "anthropic" | "claude" => self.anthropic_api_key.is_some(),
            _ => false,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            anthropic_api_key: None,
            anthropic_model: "claude-sonnet-4-5-20250929".to_string(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            temperature: 0.1,
            max_tokens: 4096,
        }
    }
}

// ── Agent loop ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model calls allowed per user turn.
    pub max_steps: u32,
    /// Seconds an approval request may stay unanswered; 0 waits forever.
    pub approval_timeout_secs: u64,
    /// Minimum spacing between keep-alive extensions.
    pub keepalive_interval_secs: u64,
    /// Approximate token budget for the model input.
    pub max_context_tokens: usize,
    pub system_prompt: Option<String>,
}

impl AgentConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            max_steps: profiled_env_u32(p, "AGENT_MAX_STEPS", 5),
            approval_timeout_secs: profiled_env_u64(p, "AGENT_APPROVAL_TIMEOUT_SECS", 300),
            keepalive_interval_secs: profiled_env_u64(p, "AGENT_KEEPALIVE_SECS", 30),
            max_context_tokens: profiled_env_u64(p, "AGENT_MAX_CONTEXT_TOKENS", 100_000) as usize,
            system_prompt: profiled_env_opt(p, "AGENT_SYSTEM_PROMPT"),
        }
    }

    pub fn approval_timeout(&self) -> Option<Duration> {
        match self.approval_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

// ── Built-in tools ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub geocoding_url: String,
    pub forecast_url: String,
    pub http_timeout_secs: u64,
}

impl ToolsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            geocoding_url: profiled_env_or(
                p,
                "GEOCODING_URL",
                "https://geocoding-api.open-meteo.com/v1/search",
            ),
            forecast_url: profiled_env_or(p, "FORECAST_URL", "https://api.open-meteo.com/v1/forecast"),
            http_timeout_secs: profiled_env_u64(p, "TOOLS_HTTP_TIMEOUT_SECS", 10),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_unknown_profile() {
        let config = Config::for_profile("dchat_unit_defaults");
        assert_eq!(config.profile, "DCHAT_UNIT_DEFAULTS");
        assert_eq!(config.agent.approval_timeout(), Some(Duration::from_secs(300)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_profiled_key_wins() {
        env::set_var("DCHATPROFILEDTEST_AGENT_MAX_STEPS", "9");
        let config = Config::for_profile("dchatprofiledtest");
        assert_eq!(config.agent.max_steps, 9);
        env::remove_var("DCHATPROFILEDTEST_AGENT_MAX_STEPS");
    }

    #[test]
    fn test_zero_timeout_disables_expiry() {
        let mut config = Config::for_profile("dchat_unit_timeout");
        config.agent.approval_timeout_secs = 0;
        assert_eq!(config.agent.approval_timeout(), None);
    }

    #[test]
    fn test_validate_rejects_zero_steps() {
        let mut config = Config::for_profile("dchat_unit_steps");
        config.agent.max_steps = 0;
        assert!(matches!(config.validate(), Err(DchatError::Config(_))));
    }

    #[test]
    fn test_redacted_summary_hides_key() {
        let mut config = Config::for_profile("dchat_unit_redact");
        config.llm.anthropic_api_key = Some("sk-secret".into());
        let summary = config.redacted_summary().to_string();
        assert!(!summary.contains("sk-secret"));
        assert!(summary.contains("\"configured\":true"));
    }
}
