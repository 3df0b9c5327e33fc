//! Conversation pipeline: history sanitation, tool resolution, the round loop,
//! and the event stream that clients follow.

pub mod actor;
pub mod context;
pub mod conversation;
pub mod llm;
pub mod publisher;
pub mod resolver;
pub mod sanitize;
pub mod tool_registry;

/// Task-owned conversation and its handle.
pub use actor::{
    CommandReceipt, CommandResult, ConversationCommand, ConversationHandle, spawn_conversation,
};
/// History to chat message conversion.
pub use context::history_to_chat_messages;
/// Round loop orchestration.
pub use conversation::{
    Conversation, ConversationConfig, DEFAULT_MAX_ROUNDS, TurnOutcome, build_system_prompt,
};
/// Chat request models and provider interfaces.
pub use llm::{
    ChatMessage, ChatRequest, ChatRole, LlmProvider, ModelChunk, ModelStream, OpenAiProvider,
    TokenUsage, ToolCallAccumulator, ToolCallFragment,
};
/// Sequenced event stream.
pub use publisher::{DEFAULT_EVENT_CAPACITY, Delivery, EventSubscription, StreamPublisher};
/// Approval bookkeeping and tool execution.
pub use resolver::{DecisionOutcome, Resolution, ToolInvocationResolver};
/// History repair before model calls.
pub use sanitize::sanitize_history;
/// Runtime tool registry.
pub use tool_registry::ToolRegistry;
