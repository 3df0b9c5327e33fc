//! Shared protocol types for the conversation pipeline, tools, and gateway.
//!
//! This crate defines the serializable message/part model, stream events,
//! approval signals, tool declarations, and strongly-typed error enums shared
//! across the workspace.

pub mod approval;
pub mod error;
pub mod event;
pub mod message;
pub mod tool;

/// Re-export of approval signal types.
pub use approval::{ApprovalDecision, ApprovalSignal, DECLINED_OUTPUT};
/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of stream and turn types.
pub use event::{
    CLEAR_COMMAND, Checkpoint, FinishReason, LoopState, SequencedEvent, StreamEvent, TurnInput,
};
/// Re-export of the conversation data model.
pub use message::{ApprovalStatus, Message, Part, Role, ToolInvocation, ToolState};
/// Re-export of tool call definition types.
pub use tool::{ToolCall, ToolDefinition};
