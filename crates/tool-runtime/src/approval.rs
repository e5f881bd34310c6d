//! Approval gate: decides per tool call whether it may run immediately,
//! must wait for an operator decision, or is refused outright.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::registry::{RegistryError, ToolRegistry};
use crate::tool::Tool;

/// Operator override for a tool, layered on top of the tool's own predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyLevel {
    /// Defer to the tool's approval predicate
    Auto,
    /// Always ask the operator
    Confirm,
    /// Never ask, even if the tool's predicate would
    Never,
    /// Refuse the call without asking
    Deny,
}

impl PolicyLevel {
    /// Parse the config-file spelling ("auto", "confirm", "never", "deny").
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "confirm" | "require_confirmation" => Some(Self::Confirm),
            "never" | "auto_approve" => Some(Self::Never),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

/// Maps tool names to policy levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    /// Explicit per-tool levels; keys ending in `*` match by prefix
    pub rules: HashMap<String, PolicyLevel>,
    /// Level for tools not in the rules map
    pub default: PolicyLevel,
}

impl ApprovalPolicy {
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
            default: PolicyLevel::Auto,
        }
    }

    pub fn with_rule(mut self, pattern: impl Into<String>, level: PolicyLevel) -> Self {
        self.rules.insert(pattern.into(), level);
        self
    }

    /// Get the level for a given tool name.
    /// Checks exact match first, then the longest matching glob prefix, then default.
    pub fn level_for(&self, tool_name: &str) -> PolicyLevel {
        if let Some(&level) = self.rules.get(tool_name) {
            return level;
        }
        self.rules
            .iter()
            .filter_map(|(pattern, &level)| {
                let prefix = pattern.strip_suffix('*')?;
                tool_name.starts_with(prefix).then_some((prefix.len(), level))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, level)| level)
            .unwrap_or(self.default)
    }
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of gating a single call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    RequireApproval,
    Deny(String),
}

/// Combine a policy level with a tool's predicate.
pub fn decide(tool: &dyn Tool, level: PolicyLevel, input: &Value) -> GateDecision {
    match level {
        PolicyLevel::Auto if tool.requires_approval(input) => GateDecision::RequireApproval,
        PolicyLevel::Auto | PolicyLevel::Never => GateDecision::Proceed,
        PolicyLevel::Confirm => GateDecision::RequireApproval,
        PolicyLevel::Deny => GateDecision::Deny(format!(
            "Tool '{}' is denied by policy",
            tool.definition().name
        )),
    }
}

/// Stateless gate over a read-only registry and policy; identical inputs
/// always produce identical decisions.
#[derive(Clone)]
pub struct ApprovalGate {
    registry: Arc<ToolRegistry>,
    policy: Arc<ApprovalPolicy>,
}

impl ApprovalGate {
    pub fn new(registry: Arc<ToolRegistry>, policy: ApprovalPolicy) -> Self {
        Self {
            registry,
            policy: Arc::new(policy),
        }
    }

    pub fn decide(&self, tool_name: &str, input: &Value) -> Result<GateDecision, RegistryError> {
        let tool = self.registry.lookup(tool_name)?;
        Ok(decide(tool.as_ref(), self.policy.level_for(tool_name), input))
    }

    /// True when the call has to wait for an operator decision.
    pub fn requires_approval(&self, tool_name: &str, input: &Value) -> Result<bool, RegistryError> {
        Ok(self.decide(tool_name, input)? == GateDecision::RequireApproval)
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }
}

/// An operator's answer to an approval request. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub tool_call_id: String,
    pub approved: bool,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("No tool call '{0}' is awaiting approval")]
    UnknownCall(String),
}
