//! Resolution of tool invocations: approval bookkeeping and execution.

use std::sync::Arc;

use futures_util::future::join_all;
use proto::{
    ApprovalDecision, ApprovalSignal, ApprovalStatus, DECLINED_OUTPUT, Message, ToolInvocation,
    ToolState,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::tool_registry::ToolRegistry;

/// Result of one resolve pass over a message.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Resolution {
    /// Invocations that reached a terminal state during this pass, in part order.
    pub completed: Vec<ToolInvocation>,
    /// Call ids still waiting for a human decision.
    pub awaiting_approval: Vec<String>,
}

impl Resolution {
    pub fn is_suspended(&self) -> bool {
        !self.awaiting_approval.is_empty()
    }
}

/// What happened to an [`ApprovalSignal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionOutcome {
    /// The pending invocation now carries the decision.
    Applied,
    /// The invocation exists but is not waiting for a decision.
    AlreadyDecided,
    /// No invocation with that id.
    Unknown,
}

/// Resolves `input-available` invocations against a [`ToolRegistry`].
#[derive(Clone)]
pub struct ToolInvocationResolver {
    registry: Arc<ToolRegistry>,
}

impl ToolInvocationResolver {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Runs one pass over `message`.
    ///
    /// Approved and auto-approved calls execute concurrently; every result is
    /// written back into its own part, so part order never changes.
    pub async fn resolve(&self, message: &mut Message) -> Resolution {
        let mut resolution = Resolution::default();
        let mut runnable: Vec<(usize, String, Value)> = Vec::new();
        let mut terminal: Vec<usize> = Vec::new();

        for (index, part) in message.parts.iter_mut().enumerate() {
            let Some(inv) = part.as_tool_invocation_mut() else {
                continue;
            };
            let ToolState::InputAvailable { approval } = inv.state else {
                continue;
            };
            match approval {
                None if self.registry.requires_confirmation(&inv.tool_name) => {
                    debug!(tool_call_id = %inv.tool_call_id, tool = %inv.tool_name, "Awaiting approval");
                    inv.state = ToolState::InputAvailable {
                        approval: Some(ApprovalStatus::Pending),
                    };
                    resolution.awaiting_approval.push(inv.tool_call_id.clone());
                }
                Some(ApprovalStatus::Pending) => {
                    resolution.awaiting_approval.push(inv.tool_call_id.clone());
                }
                Some(ApprovalStatus::Denied) => {
                    info!(tool_call_id = %inv.tool_call_id, tool = %inv.tool_name, "Tool call declined");
                    inv.state = ToolState::OutputAvailable {
                        output: Value::String(DECLINED_OUTPUT.to_string()),
                    };
                    terminal.push(index);
                }
                None | Some(ApprovalStatus::Approved) => {
                    runnable.push((index, inv.tool_name.clone(), inv.input.clone()));
                }
            }
        }

        let registry = &self.registry;
        let results = join_all(runnable.iter().map(|(_, name, input)| async move {
            registry.execute(name, input.clone()).await
        }))
        .await;

        for ((index, name, _), result) in runnable.iter().zip(results) {
            let Some(inv) = message.parts[*index].as_tool_invocation_mut() else {
                continue;
            };
            inv.state = match result {
                Ok(output) => ToolState::OutputAvailable { output },
                Err(e) => {
                    warn!(tool_call_id = %inv.tool_call_id, tool = %name, error = %e, "Tool call failed");
                    ToolState::OutputError {
                        error_text: e.to_string(),
                    }
                }
            };
            terminal.push(*index);
        }

        terminal.sort_unstable();
        resolution.completed = terminal
            .into_iter()
            .filter_map(|i| message.parts[i].as_tool_invocation().cloned())
            .collect();
        resolution
    }

    /// Records a human decision on the matching pending invocation.
    ///
    /// Applying the same signal twice is a no-op the second time.
    pub fn apply_decision(&self, history: &mut [Message], signal: &ApprovalSignal) -> DecisionOutcome {
        let Some(inv) = history
            .iter_mut()
            .rev()
            .find_map(|m| m.find_tool_invocation_mut(&signal.tool_call_id))
        else {
            debug!(tool_call_id = %signal.tool_call_id, "Decision for unknown tool call");
            return DecisionOutcome::Unknown;
        };
        if !inv.is_awaiting_approval() {
            debug!(tool_call_id = %signal.tool_call_id, "Tool call already decided");
            return DecisionOutcome::AlreadyDecided;
        }
        let status = match signal.decision {
            ApprovalDecision::Yes => ApprovalStatus::Approved,
            ApprovalDecision::No => ApprovalStatus::Denied,
        };
        info!(tool_call_id = %signal.tool_call_id, ?status, "Decision recorded");
        inv.state = ToolState::InputAvailable {
            approval: Some(status),
        };
        DecisionOutcome::Applied
    }
}
