use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;

/// Literal command that resets a conversation.
pub const CLEAR_COMMAND: &str = "clear";

/// Input accepted by a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TurnInput {
    /// A user message with text content.
    User { text: String },
    /// Discard the whole history.
    Clear,
}

impl TurnInput {
    /// Interprets raw user text, recognizing the `clear` command.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        if text.trim().eq_ignore_ascii_case(CLEAR_COMMAND) {
            TurnInput::Clear
        } else {
            TurnInput::User { text }
        }
    }
}

/// Conversation loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopState {
    /// Waiting for user input.
    #[default]
    Idle,
    /// A model call is streaming.
    Generating,
    /// Tool calls are running or waiting for a human decision.
    ToolsPending,
    /// The last turn finished.
    Done,
}

/// Why a turn (or turn segment) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// The model answered without requesting more tools.
    Stop,
    /// The round budget was exhausted.
    RoundLimit,
    /// The turn is parked until approval decisions arrive.
    AwaitingApproval,
    /// The history was cleared.
    Cleared,
}

/// Incremental output of a conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// A model round begins.
    StepStart { round: usize },
    /// Text fragment to append to the current text part.
    TextDelta { delta: String },
    /// The model started a tool call.
    #[serde(rename_all = "camelCase")]
    ToolCallStart {
        tool_call_id: String,
        tool_name: String,
    },
    /// Partial argument JSON of a streaming tool call.
    #[serde(rename_all = "camelCase")]
    ToolCallDelta {
        tool_call_id: String,
        input_delta: String,
    },
    /// Arguments are complete (`input-available`).
    #[serde(rename_all = "camelCase")]
    ToolCallReady {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    /// The call needs a human decision before it runs.
    #[serde(rename_all = "camelCase")]
    ApprovalRequested {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    /// The call resolved (`output-available` or `output-error`).
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_text: Option<String>,
    },
    /// A model round and its tool resolutions are finished.
    StepFinish { round: usize },
    /// The turn (or turn segment) ended.
    TurnComplete { reason: FinishReason, rounds: usize },
    /// The model call failed; the turn is aborted.
    Error { message: String },
}

impl StreamEvent {
    /// Tool call id the event refers to, if any.
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            StreamEvent::ToolCallStart { tool_call_id, .. }
            | StreamEvent::ToolCallDelta { tool_call_id, .. }
            | StreamEvent::ToolCallReady { tool_call_id, .. }
            | StreamEvent::ApprovalRequested { tool_call_id, .. }
            | StreamEvent::ToolResult { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }
}

/// A published event with its position in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: StreamEvent,
}

/// Conversation state as of a given stream position.
///
/// Events with `seq` greater than [`Checkpoint::seq`] are not reflected
/// in `messages` yet.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: u64,
    pub state: LoopState,
    pub messages: Vec<Message>,
}
