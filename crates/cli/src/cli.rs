use clap::Parser;

/// Terminal chat client with tool calls and human approval.
///
/// Settings come from the environment (and `.env`), then the config file,
/// then these flags.
#[derive(Parser, Debug)]
#[command(name = "dchat", about = "Chat with an LLM that calls tools after your approval")]
pub struct CliArgs {
    /// Model name override
    #[arg(long)]
    pub model: Option<String>,

    /// API key (overrides env var and config file)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Path to config file (default: ~/.config/dchat/config.toml)
    #[arg(long)]
    pub config: Option<String>,

    /// Resume a previous session by name or ID
    #[arg(long)]
    pub session: Option<String>,

    /// List all saved sessions
    #[arg(long)]
    pub list_sessions: bool,

    /// System prompt override
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Maximum model steps per turn
    #[arg(long)]
    pub max_steps: Option<u32>,

    /// Seconds to wait for an approval before rejecting the call (0 waits forever)
    #[arg(long)]
    pub approval_timeout: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let args = CliArgs::parse_from([
            "dchat",
            "--model",
            "claude-test",
            "--max-steps",
            "3",
            "--session",
            "weather",
        ]);
        assert_eq!(args.model.as_deref(), Some("claude-test"));
        assert_eq!(args.max_steps, Some(3));
        assert_eq!(args.session.as_deref(), Some("weather"));
        assert!(!args.list_sessions);
        assert!(args.approval_timeout.is_none());
    }
}
