mod cli;
mod config;
mod renderer;
mod session;
mod terminal;

use anyhow::{Context, Result};
use clap::Parser;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use dchat_core::config::{load_dotenv, Config};
use dchat_llm::create_tool_provider;
use dchat_tool_runtime::{
    builtin_registry, AgenticLoop, ApprovalSender, ConversationMessage, ToolExecutor, TurnEvent,
    TurnHandle, TurnOutcome,
};

use crate::cli::CliArgs;
use crate::config::CliConfig;
use crate::renderer::CallView;
use crate::session::Session;
use crate::terminal::Terminal;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    load_dotenv();
    let args = CliArgs::parse();
    let terminal = Terminal::new();

    let cli_config =
        CliConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let sessions_dir = CliConfig::ensure_sessions_dir()?;

    if args.list_sessions {
        let sessions = Session::list_all(&sessions_dir)?;
        terminal.print_sessions(&sessions)?;
        return Ok(());
    }

    let mut config = Config::from_env();
    cli_config.apply(&mut config, &args);
    config.validate().context("invalid configuration")?;
    config.log_summary();

    let provider = create_tool_provider(&config.llm).context("failed to create LLM provider")?;
    let registry =
        Arc::new(builtin_registry(&config.tools).context("failed to register built-in tools")?);
    let tool_names: Vec<String> = registry.list().into_iter().map(|d| d.name).collect();
    let executor = ToolExecutor::new(registry, cli_config.approval_policy());

    let mut session = if let Some(ref session_id) = args.session {
        info!(session = %session_id, "Resuming session");
        let mut loaded = Session::load(&sessions_dir, session_id)
            .with_context(|| format!("failed to load session '{}'", session_id))?;
        if args.system_prompt.is_some() {
            loaded.system_prompt = config.agent.system_prompt.clone();
        }
        terminal.print_info(&format!(
            "Resumed session: {} ({} messages)",
            loaded.name,
            loaded.messages.len()
        ))?;
        loaded
    } else {
        Session::new(
            config.llm.anthropic_model.clone(),
            config.agent.system_prompt.clone(),
        )
    };

    let mut agent = AgenticLoop::new(provider, executor)
        .with_agent_config(&config.agent)
        .with_temperature(config.llm.temperature)
        .with_max_tokens(config.llm.max_tokens);
    if let Some(ref prompt) = session.system_prompt {
        agent = agent.with_system_prompt(prompt.clone());
    }

    terminal.print_banner(&config.llm.anthropic_model, &tool_names)?;

    loop {
        let input = match terminal.read_input()? {
            Some(text) => text,
            None => {
                terminal.print_info("Goodbye.")?;
                break;
            }
        };

        if input.is_empty() {
            continue;
        }

        match run_turn(&agent, terminal, session.messages.clone(), &input).await {
            Ok(Some(outcome)) => {
                session.messages.push(ConversationMessage::user(input));
                session.messages.push(outcome.message);
            }
            Ok(None) => terminal.print_info("[turn abandoned]")?,
            Err(e) => {
                error!(error = %e, "Turn failed");
                terminal.print_error(&format!("{:#}", e))?;
            }
        }

        session.update_name_from_first_message();
        if let Err(e) = session.save(&sessions_dir) {
            warn!(error = %e, "Failed to auto-save session");
        }
    }

    save_final(&mut session, &sessions_dir, terminal)
}

enum Next<T> {
    Ready(T),
    Interrupted,
}

/// Drive one turn: render its events, answer approval prompts, and return
/// the finished assistant message. `None` when the operator abandoned it.
async fn run_turn(
    agent: &AgenticLoop,
    terminal: Terminal,
    history: Vec<ConversationMessage>,
    input: &str,
) -> Result<Option<TurnOutcome>> {
    let mut handle = agent.handle_turn(history, input);
    let approvals = handle.approvals();

    loop {
        let next = interruptible(handle.next_event(), tokio::signal::ctrl_c()).await;

        let event = match next {
            Next::Ready(Some(event)) => event,
            Next::Ready(None) => break,
            Next::Interrupted => return abandon(handle, approvals).await,
        };

        terminal.display_event(&event)?;

        let TurnEvent::ToolCallUpdate { call } = event else {
            continue;
        };
        let view = CallView::from(&call);
        let CallView::AwaitingDecision { id, .. } = &view else {
            continue;
        };
        let id = id.clone();
        let prompt = tokio::task::spawn_blocking(move || terminal.prompt_approval(&view));
        let approved = match interruptible(prompt, tokio::signal::ctrl_c()).await {
            Next::Ready(answer) => answer.context("approval prompt task failed")??,
            Next::Interrupted => {
                // the prompt's stdin read stays blocked and takes the next line
                terminal.print_info("\nPress Enter to continue.")?;
                return abandon(handle, approvals).await;
            }
        };
        if let Err(e) = approvals.submit_approval(id, approved).await {
            // the request expired while the prompt was open
            terminal.print_error(&e.to_string())?;
        }
    }

    drop(approvals);
    let outcome = handle.join().await.context("turn failed")?;
    debug!(reason = ?outcome.reason, steps = outcome.steps, "Turn complete");
    Ok(Some(outcome))
}

/// Wait for `work` unless `interrupt` fires first.
async fn interruptible<F, I>(work: F, interrupt: I) -> Next<F::Output>
where
    F: Future,
    I: Future,
{
    tokio::select! {
        output = work => Next::Ready(output),
        _ = interrupt => Next::Interrupted,
    }
}

/// Stop a turn on Ctrl+C. Pending approvals are rejected and the runner
/// stops after the current step.
async fn abandon(handle: TurnHandle, approvals: ApprovalSender) -> Result<Option<TurnOutcome>> {
    drop(approvals);
    let result = handle.abandon().await;
    debug!(?result, "Abandoned turn finished");
    Ok(None)
}

fn save_final(session: &mut Session, dir: &Path, terminal: Terminal) -> Result<()> {
    session.update_name_from_first_message();
    match session.save(dir) {
        Ok(_) => terminal.print_info(&format!("Session saved: {}", session.id)),
        Err(e) => terminal.print_error(&format!("Failed to save session: {}", e)),
    }
}
