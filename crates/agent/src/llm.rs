//! Streaming LLM provider abstraction and OpenAI-compatible implementation.

use std::collections::{BTreeMap, VecDeque};

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionResponseStream, ChatCompletionTool, ChatCompletionToolType,
        CreateChatCompletionRequestArgs, FunctionCall, FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use proto::{LlmError, ToolCall, ToolDefinition};
use serde_json::Value;
use tracing::{debug, warn};

/// Role of a provider-level chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// Represents a message in a chat history
#[derive(Debug, Clone)]
pub struct ChatMessage {
    /// Semantic role of this message.
    pub role: ChatRole,
    /// Human-readable text content.
    pub content: String,
    /// Tool call id when this is a tool result.
    pub tool_call_id: Option<String>,
    /// Tool calls requested by assistant messages.
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    fn with_role(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Creates a system-role message with the given content.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(ChatRole::System, content)
    }

    /// Creates a user-role message with the given content.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(ChatRole::User, content)
    }

    /// Creates an assistant-role message with the given content.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(ChatRole::Assistant, content)
    }

    /// Creates a tool-result message linking a call id and output content.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(ChatRole::Tool, content)
        }
    }
}

/// Request to the LLM
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Full chat history including system/user/assistant/tool messages.
    pub messages: Vec<ChatMessage>,
    /// Available tools schema.
    pub tools: Vec<ToolDefinition>,
    /// Target model id.
    pub model: String,
}

/// Token usage reported by the LLM for a single call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Number of tokens in the prompt / input.
    pub prompt_tokens: u32,
    /// Number of tokens in the generated output.
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Accumulates another usage record into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

/// One increment of a streamed model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    /// Text fragment.
    TextDelta(String),
    /// A tool call began.
    ToolCallStart { id: String, name: String },
    /// More argument JSON for a started call.
    ToolCallDelta { id: String, arguments_delta: String },
    /// The call's arguments are complete.
    ToolCallReady(ToolCall),
    /// End of the response.
    Finish { usage: TokenUsage },
}

/// Stream of model chunks for one generation round.
pub type ModelStream = BoxStream<'static, Result<ModelChunk, LlmError>>;

/// LLM provider trait
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Starts a streaming chat completion.
    async fn stream_chat(&self, req: ChatRequest) -> Result<ModelStream, LlmError>;
}

/// A fragment of a tool call as delivered by streaming chat APIs.
#[derive(Debug, Clone, Default)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
    started: bool,
}

/// Reassembles tool calls whose id, name, and arguments arrive in pieces keyed by index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    /// Feeds one fragment and returns the chunks it makes observable.
    pub fn push(&mut self, fragment: ToolCallFragment) -> Vec<ModelChunk> {
        let call = self.calls.entry(fragment.index).or_default();
        if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
            call.id = id;
        }
        if let Some(name) = fragment.name.filter(|name| !name.is_empty()) {
            call.name = name;
        }
        let arguments = fragment.arguments.filter(|a| !a.is_empty());
        if let Some(delta) = &arguments {
            call.arguments.push_str(delta);
        }

        let mut chunks = Vec::new();
        if !call.started {
            if !call.id.is_empty() && !call.name.is_empty() {
                call.started = true;
                chunks.push(ModelChunk::ToolCallStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
                if !call.arguments.is_empty() {
                    chunks.push(ModelChunk::ToolCallDelta {
                        id: call.id.clone(),
                        arguments_delta: call.arguments.clone(),
                    });
                }
            }
        } else if let Some(delta) = arguments {
            chunks.push(ModelChunk::ToolCallDelta {
                id: call.id.clone(),
                arguments_delta: delta,
            });
        }
        chunks
    }

    /// Completes every accumulated call in index order.
    pub fn finish(&mut self) -> Vec<ModelChunk> {
        let mut chunks = Vec::new();
        for (index, mut call) in std::mem::take(&mut self.calls) {
            if call.id.is_empty() {
                call.id = format!("call_{index}");
            }
            if !call.started {
                chunks.push(ModelChunk::ToolCallStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
            }
            chunks.push(ModelChunk::ToolCallReady(ToolCall {
                id: call.id,
                name: call.name,
                arguments: parse_tool_arguments(&call.arguments),
            }));
        }
        chunks
    }
}

/// OpenAI-compatible provider (works with OpenAI, together.ai, Ollama, etc.)
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
}

impl OpenAiProvider {
    /// Creates an OpenAI provider using the default API base URL.
    pub fn new(api_key: impl Into<String>) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Self {
            client: Client::with_config(config),
        }
    }

    /// Creates an OpenAI provider with a custom API base URL.
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(base_url);
        Self {
            client: Client::with_config(config),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn stream_chat(&self, req: ChatRequest) -> Result<ModelStream, LlmError> {
        let messages: Vec<ChatCompletionRequestMessage> = req
            .messages
            .iter()
            .map(convert_message)
            .collect::<Result<_, _>>()?;

        let tools: Vec<ChatCompletionTool> = req
            .tools
            .iter()
            .map(convert_tool)
            .collect::<Result<_, _>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&req.model).messages(messages).stream(true);

        if !tools.is_empty() {
            builder.tools(tools);
        }

        let request = builder
            .build()
            .map_err(|e| LlmError::Serialization(e.to_string()))?;

        debug!(
            model = %req.model,
            messages = %req.messages.len(),
            tools = %req.tools.len(),
            "Starting streaming request"
        );

        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(map_api_error)?;
        Ok(assemble_stream(stream))
    }
}

struct StreamState {
    inner: ChatCompletionResponseStream,
    accumulator: ToolCallAccumulator,
    pending: VecDeque<ModelChunk>,
    usage: TokenUsage,
    finished: bool,
}

/// Turns raw completion chunks into [`ModelChunk`]s.
fn assemble_stream(inner: ChatCompletionResponseStream) -> ModelStream {
    let state = StreamState {
        inner,
        accumulator: ToolCallAccumulator::default(),
        pending: VecDeque::new(),
        usage: TokenUsage::default(),
        finished: false,
    };
    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                return Some((Ok(chunk), st));
            }
            if st.finished {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(response)) => {
                    if let Some(usage) = response.usage {
                        st.usage = TokenUsage {
                            prompt_tokens: usage.prompt_tokens,
                            completion_tokens: usage.completion_tokens,
                        };
                    }
                    for choice in response.choices {
                        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                            st.pending.push_back(ModelChunk::TextDelta(text));
                        }
                        for tc in choice.delta.tool_calls.unwrap_or_default() {
                            let (name, arguments) = tc
                                .function
                                .map(|f| (f.name, f.arguments))
                                .unwrap_or((None, None));
                            st.pending.extend(st.accumulator.push(ToolCallFragment {
                                index: tc.index,
                                id: tc.id,
                                name,
                                arguments,
                            }));
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Model stream failed");
                    st.finished = true;
                    return Some((Err(LlmError::Stream(e.to_string())), st));
                }
                None => {
                    st.finished = true;
                    st.pending.extend(st.accumulator.finish());
                    st.pending.push_back(ModelChunk::Finish {
                        usage: std::mem::take(&mut st.usage),
                    });
                }
            }
        }
    })
    .boxed()
}

/// Maps provider errors, adding a hint for the most common misconfigurations.
fn map_api_error(e: OpenAIError) -> LlmError {
    let msg = e.to_string();
    debug!(error = %msg, "OpenAI API error");
    let lower = msg.to_lowercase();
    if lower.contains("rate limit") {
        return LlmError::RateLimit;
    }
    let hint = if msg.contains("does not exist") || msg.contains("model_not_found") {
        " Check agent.model in the config file."
    } else if lower.contains("billing") || lower.contains("quota") {
        " Check your provider billing settings."
    } else {
        ""
    };
    LlmError::Api(format!("{msg}{hint}"))
}

/// Converts internal chat message into OpenAI request format.
fn convert_message(m: &ChatMessage) -> Result<ChatCompletionRequestMessage, LlmError> {
    match m.role {
        ChatRole::System => Ok(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(m.content.clone())
                .build()
                .map_err(|e| LlmError::Serialization(e.to_string()))?,
        )),
        ChatRole::User => Ok(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(m.content.clone())
                .build()
                .map_err(|e| LlmError::Serialization(e.to_string()))?,
        )),
        ChatRole::Assistant => {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            builder.content(m.content.clone());

            if let Some(tool_calls) = &m.tool_calls {
                let tc: Vec<ChatCompletionMessageToolCall> = tool_calls
                    .iter()
                    .map(|tc| ChatCompletionMessageToolCall {
                        id: tc.id.clone(),
                        r#type: ChatCompletionToolType::Function,
                        function: FunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.arguments.to_string(),
                        },
                    })
                    .collect();
                builder.tool_calls(tc);
            }

            Ok(ChatCompletionRequestMessage::Assistant(
                builder
                    .build()
                    .map_err(|e| LlmError::Serialization(e.to_string()))?,
            ))
        }
        ChatRole::Tool => {
            let call_id = m
                .tool_call_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            Ok(ChatCompletionRequestMessage::Tool(
                ChatCompletionRequestToolMessageArgs::default()
                    .tool_call_id(call_id)
                    .content(m.content.clone())
                    .build()
                    .map_err(|e| LlmError::Serialization(e.to_string()))?,
            ))
        }
    }
}

/// Converts internal tool schema into OpenAI function-tool declaration.
fn convert_tool(t: &ToolDefinition) -> Result<ChatCompletionTool, LlmError> {
    Ok(ChatCompletionTool {
        r#type: ChatCompletionToolType::Function,
        function: FunctionObjectArgs::default()
            .name(t.name.clone())
            .description(t.description.clone())
            .parameters(t.parameters.clone())
            .build()
            .map_err(|e| LlmError::Serialization(e.to_string()))?,
    })
}

/// Parses tool call argument JSON with empty-object fallback.
fn parse_tool_arguments(arguments: &str) -> Value {
    serde_json::from_str(arguments).unwrap_or(Value::Object(Default::default()))
}
