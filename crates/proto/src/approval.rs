//! Human-in-the-loop approval types shared by the UI collaborator and the agent.

use serde::{Deserialize, Serialize};

/// Output recorded for an invocation the user declined.
pub const DECLINED_OUTPUT: &str = "Error: User denied access to tool execution";

/// User's decision on a tool call that requires confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    /// Run the tool.
    #[serde(alias = "Yes, confirmed.")]
    Yes,
    /// Do not run the tool.
    #[serde(alias = "No, denied.")]
    No,
}

/// Out-of-band approval event keyed by tool call id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSignal {
    pub tool_call_id: String,
    pub decision: ApprovalDecision,
}

impl ApprovalSignal {
    pub fn new(tool_call_id: impl Into<String>, decision: ApprovalDecision) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            decision,
        }
    }

    /// Shorthand for an approving signal.
    pub fn approve(tool_call_id: impl Into<String>) -> Self {
        Self::new(tool_call_id, ApprovalDecision::Yes)
    }

    /// Shorthand for a declining signal.
    pub fn deny(tool_call_id: impl Into<String>) -> Self {
        Self::new(tool_call_id, ApprovalDecision::No)
    }
}
