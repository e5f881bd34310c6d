//! The turn runner: drives model steps, gates and executes proposed tool
//! calls, waits for operator decisions, and streams progress to the caller.
//!
//! Flow: user message → model step → tool calls → gate → (approval) →
//! execute → results folded into the assistant message → next step, until
//! the model stops calling tools or the step limit is reached.

use dchat_core::config::AgentConfig;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream};
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::approval::{ApprovalDecision, ApprovalError, GateDecision};
use crate::call::{StepCalls, ToolCallState, TrackedCall};
use crate::conversation::{
    next_step, Conversation, ConversationMessage, FinishReason, RetentionPolicy, StepDecision,
};
use crate::executor::ToolExecutor;
use crate::keepalive::{KeepAlive, KeepAliveTicker, NoopKeepAlive};
use crate::provider::{LlmError, ToolAwareLlmProvider};
use crate::session::{SessionStatus, StreamingSession};
use crate::stream::StreamEvent;
use crate::tool::{ToolCall, ToolDefinition, ToolResult};

const APPROVAL_QUEUE: usize = 16;

pub const APPROVAL_TIMED_OUT: &str = "approval timed out";
pub const APPROVAL_CHANNEL_CLOSED: &str = "approval channel closed";

/// Progress of a turn, in the order it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TurnEvent {
    Status {
        status: SessionStatus,
        step: u32,
    },
    TextDelta {
        text: String,
    },
    ReasoningDelta {
        text: String,
    },
    /// A tool call changed state; carries the full call snapshot
    ToolCallUpdate {
        call: TrackedCall,
    },
    Done {
        message: ConversationMessage,
        reason: FinishReason,
        steps: u32,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// The assistant message holding every step of the turn
    pub message: ConversationMessage,
    pub reason: FinishReason,
    pub steps: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
    #[error("Model stream failed: {0}")]
    Stream(String),
    #[error("Turn abandoned by the client")]
    Abandoned,
    #[error("Turn task failed: {0}")]
    Task(String),
}

struct ApprovalCommand {
    decision: ApprovalDecision,
    reply: oneshot::Sender<Result<TrackedCall, ApprovalError>>,
}

/// The human-approval channel of one turn.
#[derive(Clone)]
pub struct ApprovalSender {
    tx: mpsc::Sender<ApprovalCommand>,
}

impl ApprovalSender {
    /// Resolve a call in `approval-requested`. Returns the updated call, or
    /// `UnknownCall` if no such call is waiting (or the turn is over).
    pub async fn submit_approval(
        &self,
        tool_call_id: impl Into<String>,
        approved: bool,
    ) -> Result<TrackedCall, ApprovalError> {
        let tool_call_id = tool_call_id.into();
        let (reply, response) = oneshot::channel();
        let command = ApprovalCommand {
            decision: ApprovalDecision {
                tool_call_id: tool_call_id.clone(),
                approved,
            },
            reply,
        };
        if self.tx.send(command).await.is_err() {
            return Err(ApprovalError::UnknownCall(tool_call_id));
        }
        response
            .await
            .unwrap_or(Err(ApprovalError::UnknownCall(tool_call_id)))
    }
}

/// Caller's side of a running turn.
pub struct TurnHandle {
    events: mpsc::UnboundedReceiver<TurnEvent>,
    approvals: ApprovalSender,
    task: JoinHandle<Result<TurnOutcome, TurnError>>,
}

impl TurnHandle {
    pub async fn next_event(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    pub fn events(&mut self) -> impl Stream<Item = TurnEvent> + '_ {
        futures::stream::poll_fn(move |cx| self.events.poll_recv(cx))
    }

    pub fn approvals(&self) -> ApprovalSender {
        self.approvals.clone()
    }

    /// Wait for the turn to end, discarding events not yet read. Drops this
    /// handle's approval sender: unless a clone is still held elsewhere,
    /// calls still waiting for a decision are rejected.
    pub async fn join(self) -> Result<TurnOutcome, TurnError> {
        let TurnHandle {
            mut events,
            approvals,
            task,
        } = self;
        drop(approvals);
        while events.recv().await.is_some() {}
        task.await.map_err(|e| TurnError::Task(e.to_string()))?
    }

    /// Stop listening. The runner finishes the current step (tools already
    /// started run to completion) and makes no further model calls.
    pub fn abandon(self) -> JoinHandle<Result<TurnOutcome, TurnError>> {
        self.task
    }
}

/// The core agentic loop that orchestrates LLM ↔ Tool execution.
#[derive(Clone)]
pub struct AgenticLoop {
    provider: Arc<dyn ToolAwareLlmProvider>,
    executor: ToolExecutor,
    keep_alive: Arc<dyn KeepAlive>,
    system_prompt: Option<String>,
    max_steps: u32,
    temperature: f32,
    max_tokens: u32,
    max_context_tokens: usize,
    retention: RetentionPolicy,
    approval_timeout: Option<Duration>,
    keepalive_interval: Duration,
}

impl AgenticLoop {
    pub fn new(provider: Arc<dyn ToolAwareLlmProvider>, executor: ToolExecutor) -> Self {
        Self {
            provider,
            executor,
            keep_alive: Arc::new(NoopKeepAlive),
            system_prompt: None,
            max_steps: 5,
            temperature: 0.0,
            max_tokens: 4096,
            max_context_tokens: 100_000,
            retention: RetentionPolicy::default(),
            approval_timeout: Some(Duration::from_secs(300)),
            keepalive_interval: Duration::from_secs(30),
        }
    }

    pub fn with_agent_config(mut self, config: &AgentConfig) -> Self {
        self.max_steps = config.max_steps;
        self.approval_timeout = config.approval_timeout();
        self.keepalive_interval = config.keepalive_interval();
        self.max_context_tokens = config.max_context_tokens;
        if let Some(prompt) = &config.system_prompt {
            self.system_prompt = Some(prompt.clone());
        }
        self
    }

    pub fn with_max_steps(mut self, max: u32) -> Self {
        self.max_steps = max;
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// `None` leaves approval requests pending until decided.
    pub fn with_approval_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, handle: Arc<dyn KeepAlive>, interval: Duration) -> Self {
        self.keep_alive = handle;
        self.keepalive_interval = interval;
        self
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    /// Run one user turn on its own task.
    pub fn handle_turn(
        &self,
        history: Vec<ConversationMessage>,
        user_message: impl Into<String>,
    ) -> TurnHandle {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (approval_tx, approval_rx) = mpsc::channel(APPROVAL_QUEUE);
        let runner = TurnRunner {
            session: StreamingSession::new(self.max_steps),
            ticker: KeepAliveTicker::new(self.keep_alive.clone(), self.keepalive_interval),
            agent: self.clone(),
            events: event_tx,
            approvals: approval_rx,
            approvals_open: true,
        };
        let task = tokio::spawn(runner.run(history, user_message.into()));
        TurnHandle {
            events: event_rx,
            approvals: ApprovalSender { tx: approval_tx },
            task,
        }
    }
}

struct TurnRunner {
    agent: AgenticLoop,
    session: StreamingSession,
    ticker: KeepAliveTicker,
    events: mpsc::UnboundedSender<TurnEvent>,
    approvals: mpsc::Receiver<ApprovalCommand>,
    approvals_open: bool,
}

impl TurnRunner {
    async fn run(
        mut self,
        history: Vec<ConversationMessage>,
        user_message: String,
    ) -> Result<TurnOutcome, TurnError> {
        let mut conversation = Conversation::from_messages(history, self.agent.max_context_tokens)
            .with_retention(self.agent.retention);
        if let Some(prompt) = &self.agent.system_prompt {
            conversation = conversation.with_system_prompt(prompt.clone());
        }
        conversation.push(ConversationMessage::user(user_message));

        let tools = self.agent.executor.registry().list();
        let mut message = ConversationMessage::assistant();

        loop {
            let step = match self.session.begin_step() {
                Ok(step) => step,
                Err(e) => {
                    warn!(error = %e, "no step available");
                    return Ok(self.finish(message, FinishReason::StepLimit));
                }
            };
            self.emit_status();
            if step > 1 {
                message.push_step_boundary();
            }
            debug!(step, "starting model step");

            let in_flight = (!message.parts.is_empty()).then_some(&message);
            let input = conversation.next_model_input(in_flight, &[]);
            let mut calls = match self
                .stream_step(input, conversation.system_prompt(), &tools, &mut message)
                .await
            {
                Ok(calls) => calls,
                Err(e) => return Err(self.fail(e)),
            };

            let proposed = calls.len();
            if proposed > 0 {
                info!(step, count = proposed, "settling tool calls");
                self.settle_step(&mut calls, &mut message).await;
            }

            match next_step(proposed, &self.session) {
                StepDecision::Finish(reason) => return Ok(self.finish(message, reason)),
                StepDecision::Continue if self.events.is_closed() => {
                    info!(step, "client went away, stopping turn");
                    self.session.fail("abandoned");
                    return Err(TurnError::Abandoned);
                }
                StepDecision::Continue => {}
            }
        }
    }

    fn emit(&self, event: TurnEvent) {
        // A closed channel means the client is gone; checked between steps.
        let _ = self.events.send(event);
    }

    fn emit_status(&self) {
        self.emit(TurnEvent::Status {
            status: self.session.status,
            step: self.session.step_count,
        });
    }

    fn publish(&self, message: &mut ConversationMessage, call: TrackedCall) {
        message.upsert_tool_call(call.clone());
        self.emit(TurnEvent::ToolCallUpdate { call });
    }

    fn finish(&mut self, message: ConversationMessage, reason: FinishReason) -> TurnOutcome {
        self.session.finish();
        self.emit_status();
        let steps = self.session.step_count;
        self.emit(TurnEvent::Done {
            message: message.clone(),
            reason,
            steps,
        });
        TurnOutcome {
            message,
            reason,
            steps,
        }
    }

    fn fail(&mut self, error: TurnError) -> TurnError {
        let reason = error.to_string();
        self.session.fail(&reason);
        self.emit_status();
        self.emit(TurnEvent::Error { message: reason });
        error
    }

    fn refuse(command: ApprovalCommand) {
        let id = command.decision.tool_call_id;
        debug!(id = %id, "decision for a call that is not awaiting approval");
        let _ = command.reply.send(Err(ApprovalError::UnknownCall(id)));
    }

    /// Stream one model step into `message`. Returns the proposed calls,
    /// each either `input-available` or already failed.
    async fn stream_step(
        &mut self,
        input: Vec<ConversationMessage>,
        system_prompt: Option<&str>,
        tools: &[ToolDefinition],
        message: &mut ConversationMessage,
    ) -> Result<StepCalls, TurnError> {
        let mut stream = self
            .agent
            .provider
            .stream_with_tools(
                input,
                system_prompt.map(String::from),
                tools.to_vec(),
                self.agent.temperature,
                self.agent.max_tokens,
            )
            .await?;

        let mut calls = StepCalls::new();
        let mut arguments: HashMap<String, String> = HashMap::new();

        loop {
            tokio::select! {
                event = stream.next() => {
                    let Some(event) = event else { break };
                    self.ticker.tick(self.session.status);
                    match event? {
                        StreamEvent::TextDelta { text } => {
                            message.push_text(&text);
                            self.emit(TurnEvent::TextDelta { text });
                        }
                        StreamEvent::ReasoningDelta { text } => {
                            message.push_reasoning(&text);
                            self.emit(TurnEvent::ReasoningDelta { text });
                        }
                        StreamEvent::ToolCallStart { id, name } => {
                            let call = TrackedCall::streaming(id.clone(), name);
                            if !calls.push(call.clone()) {
                                warn!(id = %id, "ignoring repeated tool call id");
                                continue;
                            }
                            debug!(id = %id, tool = %call.name(), "tool call proposed");
                            arguments.insert(id, String::new());
                            self.publish(message, call);
                        }
                        StreamEvent::ToolCallDelta { id, arguments_delta } => {
                            match arguments.get_mut(&id) {
                                Some(buffer) => buffer.push_str(&arguments_delta),
                                None => warn!(id = %id, "arguments for unknown tool call"),
                            }
                        }
                        StreamEvent::ToolCallEnd { id } => {
                            let raw = arguments.remove(&id).unwrap_or_default();
                            self.finish_input(&mut calls, message, &id, &raw);
                        }
                        StreamEvent::MessageEnd { stop_reason } => {
                            debug!(?stop_reason, "model step finished");
                        }
                        StreamEvent::Error { message } => {
                            return Err(TurnError::Stream(message));
                        }
                    }
                }
                command = self.approvals.recv(), if self.approvals_open => match command {
                    Some(command) => Self::refuse(command),
                    None => self.approvals_open = false,
                },
            }
        }

        // Calls whose end marker never arrived get whatever arguments came.
        let unfinished: Vec<String> = calls
            .iter()
            .filter(|c| c.state == ToolCallState::InputStreaming)
            .map(|c| c.id().to_string())
            .collect();
        for id in unfinished {
            let raw = arguments.remove(&id).unwrap_or_default();
            self.finish_input(&mut calls, message, &id, &raw);
        }
        Ok(calls)
    }

    fn finish_input(
        &self,
        calls: &mut StepCalls,
        message: &mut ConversationMessage,
        id: &str,
        raw: &str,
    ) {
        let Some(call) = calls.get_mut(id) else {
            warn!(id, "end of unknown tool call");
            return;
        };
        let parsed = if raw.trim().is_empty() {
            Ok(json!({}))
        } else {
            serde_json::from_str::<Value>(raw)
        };
        let outcome = match parsed {
            Ok(input) => call.mark_input_available(input),
            Err(e) => call.mark_input_available(json!({})).and_then(|()| {
                call.fail(ToolResult::error(
                    id,
                    format!("Invalid input: malformed arguments: {e}"),
                ))
            }),
        };
        match outcome {
            Ok(()) => {
                let snapshot = call.clone();
                self.publish(message, snapshot);
            }
            Err(e) => warn!(error = %e, "ignoring tool call input"),
        }
    }

    /// Gate every call of the step, then run until each one has settled.
    async fn settle_step(&mut self, calls: &mut StepCalls, message: &mut ConversationMessage) {
        let mut running: FuturesUnordered<BoxFuture<'static, ToolResult>> = FuturesUnordered::new();
        let mut deadlines: HashMap<String, Instant> = HashMap::new();

        let ids: Vec<String> = calls
            .iter()
            .filter(|c| c.state == ToolCallState::InputAvailable)
            .map(|c| c.id().to_string())
            .collect();
        for id in ids {
            let Some(call) = calls.get_mut(&id) else { continue };
            let outcome = match self.agent.executor.prepare(&call.call) {
                Err(e) => call.fail(ToolResult::error(&id, e.to_string())),
                Ok(GateDecision::Proceed) => call.gate(false).map(|()| {
                    running.push(self.execute(&call.call));
                }),
                Ok(GateDecision::RequireApproval) => call.gate(true).map(|()| {
                    if let Some(timeout) = self.agent.approval_timeout {
                        deadlines.insert(id.clone(), Instant::now() + timeout);
                    }
                }),
                Ok(GateDecision::Deny(reason)) => call.reject(reason),
            };
            if let Err(e) = outcome {
                warn!(error = %e, "gating failed");
                continue;
            }
            let snapshot = call.clone();
            self.publish(message, snapshot);
        }

        if calls.awaiting_approval() > 0 {
            self.session.await_approval();
            self.emit_status();
        }

        let mut heartbeat = tokio::time::interval(
            self.agent.keepalive_interval.max(Duration::from_millis(100)),
        );

        while !calls.all_settled() {
            if running.is_empty() && calls.awaiting_approval() == 0 {
                self.fail_stranded(calls, message);
                break;
            }
            if !self.approvals_open && calls.awaiting_approval() > 0 {
                self.reject_pending(calls, message, &mut deadlines, APPROVAL_CHANNEL_CLOSED);
                continue;
            }
            let next_deadline = deadlines.values().min().copied();

            tokio::select! {
                Some(result) = running.next(), if !running.is_empty() => {
                    let Some(call) = calls.get_mut(&result.tool_call_id) else { continue };
                    match call.complete(result) {
                        Ok(()) => {
                            let snapshot = call.clone();
                            self.publish(message, snapshot);
                        }
                        Err(e) => warn!(error = %e, "dropping tool result"),
                    }
                }
                command = self.approvals.recv(), if self.approvals_open => match command {
                    Some(command) => {
                        let ApprovalCommand { decision, reply } = command;
                        match calls.resolve_approval(&decision.tool_call_id, decision.approved) {
                            Ok(call) => {
                                let snapshot = call.clone();
                                deadlines.remove(&decision.tool_call_id);
                                info!(id = %decision.tool_call_id, approved = decision.approved, "approval resolved");
                                if decision.approved {
                                    running.push(self.execute(&snapshot.call));
                                }
                                let _ = reply.send(Ok(snapshot.clone()));
                                self.publish(message, snapshot);
                                self.resume_if_clear(calls);
                            }
                            Err(e) => {
                                debug!(error = %e, "approval refused");
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    None => {
                        debug!("approval channel closed");
                        self.approvals_open = false;
                    }
                },
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                    let now = Instant::now();
                    let expired: Vec<String> = deadlines
                        .iter()
                        .filter(|(_, at)| **at <= now)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in expired {
                        deadlines.remove(&id);
                        let Some(call) = calls.get_mut(&id) else { continue };
                        if call.reject(APPROVAL_TIMED_OUT).is_ok() {
                            warn!(id = %id, "approval request expired");
                            let snapshot = call.clone();
                            self.publish(message, snapshot);
                        }
                    }
                    self.resume_if_clear(calls);
                }
                _ = heartbeat.tick() => {
                    self.ticker.tick(self.session.status);
                }
            }
        }
    }

    fn execute(&self, call: &ToolCall) -> BoxFuture<'static, ToolResult> {
        let executor = self.agent.executor.clone();
        let call = call.clone();
        async move { executor.execute(&call).await }.boxed()
    }

    fn resume_if_clear(&mut self, calls: &StepCalls) {
        if self.session.status == SessionStatus::AwaitingApproval && calls.awaiting_approval() == 0 {
            self.session.resume();
            self.emit_status();
        }
    }

    /// Settle calls that nothing is left to drive: no execution running for
    /// them and no decision pending.
    fn fail_stranded(&self, calls: &mut StepCalls, message: &mut ConversationMessage) {
        let stranded: Vec<String> = calls
            .iter()
            .filter(|c| !c.state.is_settled())
            .map(|c| c.id().to_string())
            .collect();
        for id in stranded {
            let Some(call) = calls.get_mut(&id) else { continue };
            if call.state == ToolCallState::InputStreaming {
                let _ = call.mark_input_available(json!({}));
            }
            match call.fail(ToolResult::error(&id, "Tool call could not be completed")) {
                Ok(()) => {
                    warn!(id = %id, "settled stranded tool call");
                    let snapshot = call.clone();
                    self.publish(message, snapshot);
                }
                Err(e) => warn!(error = %e, "stranded tool call left unsettled"),
            }
        }
    }

    fn reject_pending(
        &mut self,
        calls: &mut StepCalls,
        message: &mut ConversationMessage,
        deadlines: &mut HashMap<String, Instant>,
        reason: &str,
    ) {
        let pending: Vec<String> = calls
            .iter()
            .filter(|c| c.state == ToolCallState::ApprovalRequested)
            .map(|c| c.id().to_string())
            .collect();
        for id in pending {
            deadlines.remove(&id);
            let Some(call) = calls.get_mut(&id) else { continue };
            if call.reject(reason).is_ok() {
                warn!(id = %id, reason, "approval request dropped");
                let snapshot = call.clone();
                self.publish(message, snapshot);
            }
        }
        self.resume_if_clear(calls);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalPolicy;
    use crate::provider::mock::MockLlmProvider;
    use crate::registry::ToolRegistry;
    use crate::tool::{EchoTool, ToolError, ToolResultStatus};
    use crate::tools::{CalculateTool, FnTool};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Setup {
        agent: AgenticLoop,
        provider: Arc<MockLlmProvider>,
        executions: Arc<AtomicUsize>,
    }

    /// Registry with `echo`, `calculate` and a counting `guarded` tool that
    /// always needs approval.
    fn setup() -> Setup {
        let provider = Arc::new(MockLlmProvider::new());
        let executions = Arc::new(AtomicUsize::new(0));
        let counter = executions.clone();

        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        registry.register(CalculateTool).unwrap();
        registry
            .register(
                FnTool::new("guarded", "Needs approval", json!({"type": "object"}), move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ToolError>(json!({"ran": true}))
                    }
                })
                .with_approval(|_| true),
            )
            .unwrap();
        let executor = ToolExecutor::new(Arc::new(registry), ApprovalPolicy::new());
        let agent = AgenticLoop::new(provider.clone() as Arc<dyn ToolAwareLlmProvider>, executor);
        Setup {
            agent,
            provider,
            executions,
        }
    }

    /// Drive a turn, answering every approval request with `approve`.
    async fn drive(handle: &mut TurnHandle, approve: bool) -> Vec<TurnEvent> {
        let approvals = handle.approvals();
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            if let TurnEvent::ToolCallUpdate { call } = &event {
                if call.state == ToolCallState::ApprovalRequested {
                    approvals.submit_approval(call.id(), approve).await.unwrap();
                }
            }
            events.push(event);
        }
        events
    }

    fn states_of(events: &[TurnEvent], id: &str) -> Vec<ToolCallState> {
        events
            .iter()
            .filter_map(|e| match e {
                TurnEvent::ToolCallUpdate { call } if call.id() == id => Some(call.state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_text_only_turn_finishes_after_one_step() {
        let s = setup();
        s.provider.queue_text("Hello, I'm an AI assistant!");

        let mut handle = s.agent.handle_turn(vec![], "Hello");
        let events = drive(&mut handle, true).await;
        let outcome = handle.join().await.unwrap();

        assert_eq!(outcome.reason, FinishReason::Completed);
        assert_eq!(outcome.steps, 1);
        assert_eq!(outcome.message.text(), "Hello, I'm an AI assistant!");
        assert_eq!(s.provider.call_count(), 1);
        assert!(events.contains(&TurnEvent::Status {
            status: SessionStatus::Done,
            step: 1
        }));
        assert!(matches!(events.last(), Some(TurnEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_call_without_approval_skips_approval_state() {
        let s = setup();
        s.provider
            .queue_tool_calls(&[("call_1", "echo", json!({"message": "test"}))]);
        s.provider.queue_text("Done!");

        let mut handle = s.agent.handle_turn(vec![], "Echo test");
        let events = drive(&mut handle, true).await;
        let outcome = handle.join().await.unwrap();

        let states = states_of(&events, "call_1");
        assert!(!states.contains(&ToolCallState::ApprovalRequested));
        assert_eq!(states.first(), Some(&ToolCallState::InputStreaming));
        assert_eq!(states.last(), Some(&ToolCallState::OutputAvailable));
        assert_eq!(outcome.steps, 2);
        assert_eq!(outcome.message.text(), "Done!");
    }

    #[tokio::test]
    async fn test_approved_calculation() {
        let s = setup();
        s.provider.queue_tool_calls(&[(
            "call_1",
            "calculate",
            json!({"a": 5000, "b": 2, "operator": "+"}),
        )]);
        s.provider.queue_text("5000 + 2 = 5002");

        let mut handle = s.agent.handle_turn(vec![], "What is 5000 + 2?");
        let events = drive(&mut handle, true).await;
        let outcome = handle.join().await.unwrap();

        assert_eq!(
            states_of(&events, "call_1"),
            vec![
                ToolCallState::InputStreaming,
                ToolCallState::InputAvailable,
                ToolCallState::ApprovalRequested,
                ToolCallState::Approved,
                ToolCallState::OutputAvailable,
            ]
        );
        let call = outcome.message.tool_calls().next().unwrap();
        assert_eq!(
            call.result.as_ref().unwrap().output,
            json!({"expression": "5000 + 2", "result": 5002})
        );
        assert!(events.iter().any(|e| matches!(
            e,
            TurnEvent::Status {
                status: SessionStatus::AwaitingApproval,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_rejected_calculation_folds_denial() {
        let s = setup();
        s.provider.queue_tool_calls(&[(
            "call_1",
            "calculate",
            json!({"a": 5000, "b": 2, "operator": "+"}),
        )]);
        s.provider.queue_text("Okay, I won't calculate that.");

        let mut handle = s.agent.handle_turn(vec![], "What is 5000 + 2?");
        drive(&mut handle, false).await;
        let outcome = handle.join().await.unwrap();

        let call = outcome.message.tool_calls().next().unwrap();
        assert_eq!(call.state, ToolCallState::Rejected);
        // the second model step sees the denial marker, not a result
        let requests = s.provider.requests();
        assert_eq!(requests.len(), 2);
        let seen = requests[1].messages.last().unwrap();
        let folded = seen.tool_calls().next().unwrap();
        assert_eq!(folded.result.as_ref().unwrap().status, ToolResultStatus::Denied);
        assert_eq!(folded.result.as_ref().unwrap().output["denied"], true);
    }

    #[tokio::test]
    async fn test_rejected_calls_never_execute() {
        let s = setup();
        s.provider.queue_tool_calls(&[
            ("call_1", "guarded", json!({})),
            ("call_2", "guarded", json!({})),
        ]);
        s.provider.queue_text("Understood.");

        let mut handle = s.agent.handle_turn(vec![], "Run both");
        drive(&mut handle, false).await;
        let outcome = handle.join().await.unwrap();

        assert_eq!(s.executions.load(Ordering::SeqCst), 0);
        assert!(outcome
            .message
            .tool_calls()
            .all(|c| c.state == ToolCallState::Rejected));
    }

    #[tokio::test]
    async fn test_division_by_zero_continues_turn() {
        let s = setup();
        s.provider.queue_tool_calls(&[(
            "call_1",
            "calculate",
            json!({"a": 10, "b": 0, "operator": "/"}),
        )]);
        s.provider.queue_text("You cannot divide by zero.");

        let mut handle = s.agent.handle_turn(vec![], "What is 10 / 0?");
        let events = drive(&mut handle, true).await;
        let outcome = handle.join().await.unwrap();

        assert!(!states_of(&events, "call_1").contains(&ToolCallState::ApprovalRequested));
        let call = outcome.message.tool_calls().next().unwrap();
        assert_eq!(
            call.result.as_ref().unwrap().output,
            json!({"error": "Division by zero"})
        );
        assert_eq!(outcome.reason, FinishReason::Completed);
    }

    #[tokio::test]
    async fn test_step_limit_is_normal_finish() {
        let s = setup();
        let agent = s.agent.clone().with_max_steps(2);
        for i in 0..3 {
            s.provider.queue_tool_calls(&[(
                &format!("call_{i}"),
                "echo",
                json!({"message": "again"}),
            )]);
        }

        let mut handle = agent.handle_turn(vec![], "Loop forever");
        drive(&mut handle, true).await;
        let outcome = handle.join().await.unwrap();

        assert_eq!(outcome.reason, FinishReason::StepLimit);
        assert_eq!(outcome.steps, 2);
        assert_eq!(s.provider.call_count(), 2);
        // the capped step still settled its call
        let calls: Vec<_> = outcome.message.tool_calls().collect();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.state == ToolCallState::OutputAvailable));
    }

    #[tokio::test]
    async fn test_unknown_approval_is_refused_without_change() {
        let s = setup();
        s.provider
            .queue_tool_calls(&[("call_1", "guarded", json!({}))]);
        s.provider.queue_text("Done.");

        let mut handle = s.agent.handle_turn(vec![], "Go");
        let approvals = handle.approvals();
        while let Some(event) = handle.next_event().await {
            if let TurnEvent::ToolCallUpdate { call } = &event {
                if call.state == ToolCallState::ApprovalRequested {
                    assert_eq!(
                        approvals.submit_approval("call_404", true).await.unwrap_err(),
                        ApprovalError::UnknownCall("call_404".to_string())
                    );
                    assert_eq!(s.executions.load(Ordering::SeqCst), 0);
                    let approved = approvals.submit_approval("call_1", true).await.unwrap();
                    assert_eq!(approved.state, ToolCallState::Approved);
                    // consumed exactly once
                    assert!(approvals.submit_approval("call_1", false).await.is_err());
                }
            }
        }
        let outcome = handle.join().await.unwrap();
        assert_eq!(s.executions.load(Ordering::SeqCst), 1);
        assert_eq!(
            outcome.message.tool_calls().next().unwrap().state,
            ToolCallState::OutputAvailable
        );
        // nothing is waiting once the turn is over
        assert!(approvals.submit_approval("call_1", true).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_approval_times_out() {
        let s = setup();
        let agent = s
            .agent
            .clone()
            .with_approval_timeout(Some(Duration::from_secs(300)));
        s.provider
            .queue_tool_calls(&[("call_1", "guarded", json!({}))]);
        s.provider.queue_text("No answer, moving on.");

        let mut handle = agent.handle_turn(vec![], "Go");
        let _approvals = handle.approvals();
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        let outcome = handle.join().await.unwrap();

        let call = outcome.message.tool_calls().next().unwrap();
        assert_eq!(call.state, ToolCallState::Rejected);
        assert_eq!(call.result.as_ref().unwrap().output["reason"], APPROVAL_TIMED_OUT);
        assert_eq!(s.executions.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.steps, 2);
    }

    #[tokio::test]
    async fn test_closed_approval_channel_rejects_pending() {
        let s = setup();
        let agent = s.agent.clone().with_approval_timeout(None);
        s.provider
            .queue_tool_calls(&[("call_1", "guarded", json!({}))]);
        s.provider.queue_text("Okay.");

        let handle = agent.handle_turn(vec![], "Go");
        let outcome = handle.join().await.unwrap();

        let call = outcome.message.tool_calls().next().unwrap();
        assert_eq!(call.result.as_ref().unwrap().output["reason"], APPROVAL_CHANNEL_CLOSED);
        assert_eq!(s.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_arguments_are_reported_to_model() {
        let s = setup();
        s.provider.queue_response(vec![
            StreamEvent::ToolCallStart {
                id: "call_1".to_string(),
                name: "teleport".to_string(),
            },
            StreamEvent::ToolCallEnd {
                id: "call_1".to_string(),
            },
            StreamEvent::ToolCallStart {
                id: "call_2".to_string(),
                name: "echo".to_string(),
            },
            StreamEvent::ToolCallDelta {
                id: "call_2".to_string(),
                arguments_delta: r#"{"message": "#.to_string(),
            },
            StreamEvent::ToolCallEnd {
                id: "call_2".to_string(),
            },
            StreamEvent::MessageEnd {
                stop_reason: crate::stream::StopReason::ToolUse,
            },
        ]);
        s.provider.queue_text("Sorry about that.");

        let mut handle = s.agent.handle_turn(vec![], "Go");
        drive(&mut handle, true).await;
        let outcome = handle.join().await.unwrap();

        let calls: Vec<_> = outcome.message.tool_calls().collect();
        assert_eq!(
            calls[0].result.as_ref().unwrap().output,
            json!({"error": "Unknown tool: teleport"})
        );
        let error = calls[1].result.as_ref().unwrap().output["error"].as_str().unwrap();
        assert!(error.starts_with("Invalid input: malformed arguments"));
        assert_eq!(outcome.reason, FinishReason::Completed);
    }

    #[tokio::test]
    async fn test_provider_failure_is_turn_error() {
        let s = setup();
        s.provider.queue_failure("connection refused");

        let mut handle = s.agent.handle_turn(vec![], "Hello");
        let events = drive(&mut handle, true).await;
        let err = handle.join().await.unwrap_err();

        assert!(matches!(err, TurnError::Llm(LlmError::NetworkError(_))));
        assert!(events.contains(&TurnEvent::Status {
            status: SessionStatus::Error,
            step: 1
        }));
        assert!(matches!(events.last(), Some(TurnEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_stream_error_event_is_turn_error() {
        let s = setup();
        s.provider.queue_response(vec![
            StreamEvent::TextDelta {
                text: "partial".to_string(),
            },
            StreamEvent::Error {
                message: "overloaded".to_string(),
            },
        ]);

        let handle = s.agent.handle_turn(vec![], "Hello");
        assert!(matches!(handle.join().await, Err(TurnError::Stream(m)) if m == "overloaded"));
    }

    #[tokio::test]
    async fn test_abandoned_turn_finishes_tools_but_stops() {
        let provider = Arc::new(MockLlmProvider::new());
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();
        let mut registry = ToolRegistry::new();
        registry
            .register(FnTool::new("slow", "Sleeps", json!({"type": "object"}), move |_| {
                let counter = counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ToolError>(json!("done"))
                }
            }))
            .unwrap();
        let agent = AgenticLoop::new(
            provider.clone() as Arc<dyn ToolAwareLlmProvider>,
            ToolExecutor::new(Arc::new(registry), ApprovalPolicy::new()),
        );
        provider.queue_tool_calls(&[("call_1", "slow", json!({}))]);
        provider.queue_text("never requested");

        let mut handle = agent.handle_turn(vec![], "Go");
        while let Some(event) = handle.next_event().await {
            if matches!(event, TurnEvent::ToolCallUpdate { .. }) {
                break;
            }
        }
        let result = handle.abandon().await.unwrap();

        assert!(matches!(result, Err(TurnError::Abandoned)));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_history_and_system_prompt_reach_model() {
        let s = setup();
        let agent = s.agent.clone().with_system_prompt("Be brief.");
        s.provider.queue_text("Hi again.");

        let history = vec![
            ConversationMessage::user("Hi"),
            {
                let mut m = ConversationMessage::assistant();
                m.push_text("Hello!");
                m
            },
        ];
        let handle = agent.handle_turn(history, "Hi again");
        handle.join().await.unwrap();

        let request = &s.provider.requests()[0];
        assert_eq!(request.system_prompt.as_deref(), Some("Be brief."));
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[2].text(), "Hi again");
        let names: Vec<_> = request.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["calculate", "echo", "guarded"]);
    }

    #[tokio::test]
    async fn test_repeated_call_id_is_ignored() {
        let s = setup();
        let mut events = Vec::new();
        for message in ["first", "second"] {
            events.push(StreamEvent::ToolCallStart {
                id: "dup".to_string(),
                name: "echo".to_string(),
            });
            events.push(StreamEvent::ToolCallDelta {
                id: "dup".to_string(),
                arguments_delta: json!({ "message": message }).to_string(),
            });
            events.push(StreamEvent::ToolCallEnd {
                id: "dup".to_string(),
            });
        }
        events.push(StreamEvent::MessageEnd {
            stop_reason: crate::stream::StopReason::ToolUse,
        });
        s.provider.queue_response(events);
        s.provider.queue_text("done");

        let mut handle = s.agent.handle_turn(vec![], "Echo twice");
        let outcome = tokio::time::timeout(Duration::from_secs(3), async {
            drive(&mut handle, true).await;
            handle.join().await
        })
        .await
        .expect("turn should not hang")
        .unwrap();

        assert_eq!(outcome.reason, FinishReason::Completed);
        assert_eq!(outcome.message.text(), "done");
        let calls: Vec<_> = outcome.message.tool_calls().collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].state, ToolCallState::OutputAvailable);
        assert_eq!(calls[0].call.input, json!({"message": "first"}));
        assert_eq!(s.provider.call_count(), 2);
    }

    /// Agent whose registry has an auto-run `slow` tool (sleeps `delay`) and
    /// a `guarded` tool that always needs approval.
    fn slow_and_guarded(provider: Arc<MockLlmProvider>, delay: Duration) -> AgenticLoop {
        let mut registry = ToolRegistry::new();
        registry
            .register(FnTool::new("slow", "Sleeps", json!({"type": "object"}), move |_| {
                async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, ToolError>(json!({"slept": true}))
                }
            }))
            .unwrap();
        registry
            .register(
                FnTool::new("guarded", "Needs approval", json!({"type": "object"}), |_| async {
                    Ok::<_, ToolError>(json!({"ran": true}))
                })
                .with_approval(|_| true),
            )
            .unwrap();
        AgenticLoop::new(
            provider as Arc<dyn ToolAwareLlmProvider>,
            ToolExecutor::new(Arc::new(registry), ApprovalPolicy::new()),
        )
        .with_approval_timeout(None)
    }

    #[tokio::test]
    async fn test_auto_call_finishes_while_sibling_awaits_approval() {
        let provider = Arc::new(MockLlmProvider::new());
        let agent = slow_and_guarded(provider.clone(), Duration::from_millis(100));
        provider.queue_tool_calls(&[
            ("call_slow", "slow", json!({})),
            ("call_guarded", "guarded", json!({})),
        ]);
        provider.queue_text("One ran, one was refused.");

        let mut handle = agent.handle_turn(vec![], "Do both");
        let approvals = handle.approvals();
        let mut guarded = None;
        let mut slow_finished_first = false;
        while let Some(event) = handle.next_event().await {
            let TurnEvent::ToolCallUpdate { call } = event else { continue };
            match call.id() {
                "call_guarded" => guarded = Some(call.state),
                "call_slow" if call.state == ToolCallState::OutputAvailable => {
                    // the gated sibling is still waiting on its decision
                    assert_eq!(guarded, Some(ToolCallState::ApprovalRequested));
                    slow_finished_first = true;
                    approvals.submit_approval("call_guarded", false).await.unwrap();
                }
                _ => {}
            }
        }
        let outcome = handle.join().await.unwrap();

        assert!(slow_finished_first);
        assert_eq!(guarded, Some(ToolCallState::Rejected));
        assert_eq!(outcome.reason, FinishReason::Completed);

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        let folded: Vec<_> = requests[1].messages.last().unwrap().tool_calls().collect();
        assert_eq!(folded.len(), 2);
        let slow = folded.iter().find(|c| c.id() == "call_slow").unwrap();
        assert_eq!(slow.state, ToolCallState::OutputAvailable);
        let slow_result = slow.result.as_ref().unwrap();
        assert_eq!(slow_result.status, ToolResultStatus::Success);
        assert_eq!(slow_result.output, json!({"slept": true}));
        let denied = folded.iter().find(|c| c.id() == "call_guarded").unwrap();
        assert_eq!(denied.state, ToolCallState::Rejected);
        assert_eq!(denied.result.as_ref().unwrap().status, ToolResultStatus::Denied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_calls_run_concurrently() {
        let provider = Arc::new(MockLlmProvider::new());
        let agent = slow_and_guarded(provider.clone(), Duration::from_millis(200));
        provider.queue_tool_calls(&[
            ("call_1", "slow", json!({})),
            ("call_2", "slow", json!({})),
        ]);
        provider.queue_text("Both done.");

        let started = Instant::now();
        let outcome = agent.handle_turn(vec![], "Go").join().await.unwrap();
        let elapsed = started.elapsed();

        assert!(outcome
            .message
            .tool_calls()
            .all(|c| c.state == ToolCallState::OutputAvailable));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(400), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_keep_alive_extends_while_streaming() {
        #[derive(Default)]
        struct Counting(AtomicUsize);
        impl KeepAlive for Counting {
            fn extend(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let s = setup();
        let counter = Arc::new(Counting::default());
        let agent = s
            .agent
            .clone()
            .with_keep_alive(counter.clone(), Duration::ZERO);
        s.provider.queue_text("streaming");

        agent.handle_turn(vec![], "Hi").join().await.unwrap();
        assert!(counter.0.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_pauses_while_awaiting_approval() {
        #[derive(Default)]
        struct Counting(AtomicUsize);
        impl KeepAlive for Counting {
            fn extend(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let s = setup();
        let counter = Arc::new(Counting::default());
        let agent = s
            .agent
            .clone()
            .with_approval_timeout(None)
            .with_keep_alive(counter.clone(), Duration::ZERO);
        s.provider
            .queue_tool_calls(&[("call_1", "guarded", json!({}))]);
        s.provider.queue_text("Ran it.");

        let mut handle = agent.handle_turn(vec![], "Go");
        let approvals = handle.approvals();
        while let Some(event) = handle.next_event().await {
            if event
                == (TurnEvent::Status {
                    status: SessionStatus::AwaitingApproval,
                    step: 1,
                })
            {
                let before = counter.0.load(Ordering::SeqCst);
                // several heartbeats pass while the decision is outstanding
                tokio::time::sleep(Duration::from_secs(1)).await;
                assert_eq!(counter.0.load(Ordering::SeqCst), before);
                approvals.submit_approval("call_1", true).await.unwrap();
            }
        }
        drop(approvals);
        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.reason, FinishReason::Completed);
    }
}
