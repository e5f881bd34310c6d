use anyhow::{Context, Result};
use dchat_core::Config;
use dchat_tool_runtime::{ApprovalPolicy, PolicyLevel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::cli::CliArgs;

/// CLI configuration loaded from TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Model used when neither `--model` nor the environment picks one
    #[serde(default)]
    pub default_model: Option<String>,

    /// API key used when neither `--api-key` nor `ANTHROPIC_API_KEY` is set
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default)]
    pub max_steps: Option<u32>,

    /// Seconds before an unanswered approval request is rejected (0 = never)
    #[serde(default)]
    pub approval_timeout_secs: Option<u64>,

    /// Level for tools without an entry in `tool_permissions`
    #[serde(default = "default_permission")]
    pub default_permission: String,

    /// Tool permission overrides (tool_name or prefix* -> "auto" | "confirm" | "never" | "deny")
    #[serde(default)]
    pub tool_permissions: HashMap<String, String>,
}

fn default_permission() -> String {
    "auto".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            api_key: None,
            system_prompt: None,
            max_steps: None,
            approval_timeout_secs: None,
            default_permission: default_permission(),
            tool_permissions: HashMap::new(),
        }
    }
}

fn parse_level(tool: &str, level: &str) -> PolicyLevel {
    PolicyLevel::parse(level).unwrap_or_else(|| {
        warn!(
            tool = %tool,
            level = %level,
            "Unknown permission level, defaulting to confirm"
        );
        PolicyLevel::Confirm
    })
}

impl CliConfig {
    /// Return the default config directory path: ~/.config/dchat/
    pub fn default_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("could not determine user config directory")?
            .join("dchat");
        Ok(config_dir)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load config from the given path, or the default path.
    /// A missing file is created with the defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };

        if config_path.exists() {
            debug!(?config_path, "Loading config");
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read config: {}", config_path.display()))?;
            let config: Self = toml::from_str(&content)
                .with_context(|| format!("failed to parse config: {}", config_path.display()))?;
            Ok(config)
        } else {
            debug!(?config_path, "Config file not found, using defaults");
            let config = Self::default();
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let toml_str =
                toml::to_string_pretty(&config).context("failed to serialize default config")?;
            std::fs::write(&config_path, toml_str).ok();
            Ok(config)
        }
    }

    /// Build the operator policy from `default_permission` and `tool_permissions`.
    pub fn approval_policy(&self) -> ApprovalPolicy {
        let mut policy = ApprovalPolicy::new();
        policy.default = parse_level("*", &self.default_permission);
        for (tool_name, level) in &self.tool_permissions {
            policy = policy.with_rule(tool_name.clone(), parse_level(tool_name, level));
        }
        policy
    }

    /// Layer this file and the command line over the environment config.
    /// Flags win over the file. The file fills in the API key only when the
    /// environment has none; the model and agent limits from the file
    /// replace the built-in defaults.
    pub fn apply(&self, config: &mut Config, args: &CliArgs) {
        if let Some(key) = args.api_key.clone() {
            config.llm.anthropic_api_key = Some(key);
        } else if config.llm.anthropic_api_key.is_none() {
            config.llm.anthropic_api_key = self.api_key.clone();
        }

        if let Some(model) = args.model.clone().or_else(|| self.default_model.clone()) {
            config.llm.anthropic_model = model;
        }
        if let Some(max) = args.max_steps.or(self.max_steps) {
            config.agent.max_steps = max;
        }
        if let Some(secs) = args.approval_timeout.or(self.approval_timeout_secs) {
            config.agent.approval_timeout_secs = secs;
        }
        if let Some(prompt) = args.system_prompt.clone().or_else(|| self.system_prompt.clone()) {
            config.agent.system_prompt = Some(prompt);
        }
    }

    /// Return the sessions directory path.
    pub fn sessions_dir() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("sessions"))
    }

    /// Ensure the sessions directory exists.
    pub fn ensure_sessions_dir() -> Result<PathBuf> {
        let dir = Self::sessions_dir()?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create sessions dir: {}", dir.display()))?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn env_config() -> Config {
        let mut config = Config::for_profile("");
        config.llm.anthropic_api_key = None;
        config.llm.anthropic_model = "env-model".to_string();
        config.agent.max_steps = 5;
        config.agent.system_prompt = None;
        config
    }

    #[test]
    fn test_default_config() {
        let config = CliConfig::default();
        assert_eq!(config.default_permission, "auto");
        assert!(config.tool_permissions.is_empty());
    }

    #[test]
    fn test_approval_policy_from_permissions() {
        let config: CliConfig = toml::from_str(
            r#"
            default_permission = "confirm"

            [tool_permissions]
            calculate = "auto"
            "get_*" = "never"
            danger = "deny"
            typo = "sometimes"
            "#,
        )
        .unwrap();
        let policy = config.approval_policy();
        assert_eq!(policy.level_for("calculate"), PolicyLevel::Auto);
        assert_eq!(policy.level_for("get_weather"), PolicyLevel::Never);
        assert_eq!(policy.level_for("danger"), PolicyLevel::Deny);
        assert_eq!(policy.level_for("typo"), PolicyLevel::Confirm);
        assert_eq!(policy.level_for("other"), PolicyLevel::Confirm);
    }

    #[test]
    fn test_flags_override_file() {
        let file = CliConfig {
            default_model: Some("file-model".to_string()),
            max_steps: Some(8),
            ..CliConfig::default()
        };
        let args = CliArgs::parse_from(["dchat", "--model", "flag-model"]);
        let mut config = env_config();
        file.apply(&mut config, &args);
        assert_eq!(config.llm.anthropic_model, "flag-model");
        assert_eq!(config.agent.max_steps, 8);
    }

    #[test]
    fn test_api_key_precedence() {
        let file = CliConfig {
            api_key: Some("file-key".to_string()),
            ..CliConfig::default()
        };
        let no_flags = CliArgs::parse_from(["dchat"]);

        let mut config = env_config();
        file.apply(&mut config, &no_flags);
        assert_eq!(config.llm.anthropic_api_key.as_deref(), Some("file-key"));

        let mut config = env_config();
        config.llm.anthropic_api_key = Some("env-key".to_string());
        file.apply(&mut config, &no_flags);
        assert_eq!(config.llm.anthropic_api_key.as_deref(), Some("env-key"));

        let mut config = env_config();
        file.apply(&mut config, &CliArgs::parse_from(["dchat", "--api-key", "cli-key"]));
        assert_eq!(config.llm.anthropic_api_key.as_deref(), Some("cli-key"));
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = CliConfig::load(path.to_str()).unwrap();
        assert_eq!(config.default_permission, "auto");
        assert!(path.exists());

        let reloaded = CliConfig::load(path.to_str()).unwrap();
        assert_eq!(reloaded.default_permission, "auto");
    }
}
