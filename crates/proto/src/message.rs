use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message authored by an end user.
    User,
    /// Message authored by the assistant.
    Assistant,
    /// System-level instruction message.
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(crate::error::ProtoError::InvalidRole(other.to_string())),
        }
    }
}

/// Human approval status of an invocation whose tool requires confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Waiting for the user to approve or deny.
    Pending,
    /// The user approved execution.
    Approved,
    /// The user declined execution.
    Denied,
}

/// Lifecycle of a tool invocation part.
///
/// `input-streaming → input-available → output-available | output-error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ToolState {
    /// Arguments are still being streamed by the model.
    InputStreaming,
    /// Arguments are complete; the call is ready to run (or to be approved).
    InputAvailable {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approval: Option<ApprovalStatus>,
    },
    /// The call finished and produced an output.
    OutputAvailable { output: Value },
    /// The call failed; the message is visible to the model.
    #[serde(rename_all = "camelCase")]
    OutputError { error_text: String },
}

/// A requested tool operation recorded inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(flatten)]
    pub state: ToolState,
}

impl ToolInvocation {
    /// Creates an invocation whose arguments are still streaming.
    pub fn streaming(tool_call_id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            input: Value::Null,
            state: ToolState::InputStreaming,
        }
    }

    /// Creates an invocation with complete arguments.
    pub fn available(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            input,
            state: ToolState::InputAvailable { approval: None },
        }
    }

    /// True once the invocation has an output or an error.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self.state,
            ToolState::OutputAvailable { .. } | ToolState::OutputError { .. }
        )
    }

    /// True when the invocation cannot be presented to the model as-is:
    /// its arguments are still streaming or it waits for a human decision.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self.state,
            ToolState::InputStreaming
                | ToolState::InputAvailable {
                    approval: Some(ApprovalStatus::Pending)
                }
        )
    }

    /// True while the invocation waits for a human decision.
    pub fn is_awaiting_approval(&self) -> bool {
        matches!(
            self.state,
            ToolState::InputAvailable {
                approval: Some(ApprovalStatus::Pending)
            }
        )
    }
}

/// One element of a message body. Order is render and replay order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    /// A text fragment.
    Text { text: String },
    /// A tool call and its lifecycle state.
    ToolInvocation(ToolInvocation),
}

impl Part {
    /// Creates a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    /// Returns the tool invocation if this part is one.
    pub fn as_tool_invocation(&self) -> Option<&ToolInvocation> {
        match self {
            Part::ToolInvocation(inv) => Some(inv),
            Part::Text { .. } => None,
        }
    }

    /// Mutable variant of [`Part::as_tool_invocation`].
    pub fn as_tool_invocation_mut(&mut self) -> Option<&mut ToolInvocation> {
        match self {
            Part::ToolInvocation(inv) => Some(inv),
            Part::Text { .. } => None,
        }
    }
}

/// One turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message id.
    pub id: String,
    /// Semantic role of this message.
    pub role: Role,
    /// Ordered message body.
    pub parts: Vec<Part>,
    /// Creation timestamp in UTC.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Creates a message with a fresh id and timestamp.
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            parts,
            created_at: Utc::now(),
        }
    }

    /// Creates a user message holding a single text part.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    /// Creates an empty assistant message that parts are streamed into.
    pub fn assistant() -> Self {
        Self::new(Role::Assistant, Vec::new())
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                Part::ToolInvocation(_) => None,
            })
            .collect()
    }

    /// Iterates over the tool invocations of this message in part order.
    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(Part::as_tool_invocation)
    }

    /// Finds a tool invocation by call id.
    pub fn find_tool_invocation_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolInvocation> {
        self.parts
            .iter_mut()
            .filter_map(Part::as_tool_invocation_mut)
            .find(|inv| inv.tool_call_id == tool_call_id)
    }
}
