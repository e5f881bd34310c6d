//! Claude (Anthropic API) implementation of [`ToolAwareLlmProvider`].
//!
//! Supports streaming tool use via SSE, translating between the Anthropic Messages
//! API format and the provider-agnostic [`StreamEvent`] / [`ConversationMessage`] types.
//!
//! [`ToolAwareLlmProvider`]: dchat_tool_runtime::provider::ToolAwareLlmProvider
//! [`StreamEvent`]: dchat_tool_runtime::stream::StreamEvent
//! [`ConversationMessage`]: dchat_tool_runtime::conversation::ConversationMessage

mod sse;
mod streaming;
mod translate;

pub use self::streaming::ClaudeToolProvider;
