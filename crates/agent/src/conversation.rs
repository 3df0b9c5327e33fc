//! The conversation loop: model rounds, tool resolution, and approval suspension.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::StreamExt;
use proto::{
    ApprovalSignal, ApprovalStatus, ConversationError, FinishReason, LlmError, LoopState, Message,
    Part, Role, StreamEvent, ToolInvocation, ToolState, TurnInput,
};
use tools::RepoScope;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::history_to_chat_messages;
use crate::llm::{ChatRequest, LlmProvider, ModelChunk, TokenUsage};
use crate::publisher::StreamPublisher;
use crate::resolver::{DecisionOutcome, Resolution, ToolInvocationResolver};
use crate::sanitize::sanitize_history;
use crate::tool_registry::ToolRegistry;

/// Model rounds allowed per logical turn unless configured otherwise.
pub const DEFAULT_MAX_ROUNDS: usize = 10;

const SYSTEM_PROMPT: &str = r#"You are repochat, an assistant that answers questions about one GitHub repository.
Use the available tools to read files, list directories, search code, and inspect commits, branches, issues, and pull requests before answering.
Base your answers on what the tools return. If the repository does not contain the answer, say so.
Be concise and cite file paths when you refer to code."#;

/// Builds the system prompt bound to one repository.
pub fn build_system_prompt(scope: &RepoScope) -> String {
    format!(
        "{SYSTEM_PROMPT}\n\nThe repository is {scope} (owner: {}, repo: {}). \
         Every tool call operates on this repository only.",
        scope.owner, scope.repo
    )
}

/// Per-conversation settings.
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub model: String,
    pub max_rounds: usize,
    /// Tools that need a human decision before they run.
    pub confirm_tools: HashSet<String>,
}

impl ConversationConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            confirm_tools: HashSet::new(),
        }
    }
}

/// How a call into the loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The logical turn is over.
    Finished { reason: FinishReason, rounds: usize },
    /// Parked until decisions arrive for these calls.
    AwaitingApproval { tool_call_ids: Vec<String> },
    /// History was cleared.
    Cleared,
    /// A decision was recorded (or ignored) without resuming anything.
    Unchanged,
}

/// One conversation about one repository.
pub struct Conversation {
    scope: RepoScope,
    system_prompt: String,
    config: ConversationConfig,
    llm: Arc<dyn LlmProvider>,
    resolver: ToolInvocationResolver,
    publisher: StreamPublisher,
    history: Vec<Message>,
    state: LoopState,
    round: usize,
    needs_generation: bool,
    open_round: Option<usize>,
    usage: TokenUsage,
}

impl Conversation {
    /// Creates a conversation; the confirmation set of `config` is applied to `registry`.
    pub fn new(
        scope: RepoScope,
        llm: Arc<dyn LlmProvider>,
        mut registry: ToolRegistry,
        config: ConversationConfig,
    ) -> Self {
        for name in &config.confirm_tools {
            registry.require_confirmation(name.clone());
        }
        let system_prompt = build_system_prompt(&scope);
        Self {
            scope,
            system_prompt,
            config,
            llm,
            resolver: ToolInvocationResolver::new(Arc::new(registry)),
            publisher: StreamPublisher::default(),
            history: Vec::new(),
            state: LoopState::Idle,
            round: 0,
            needs_generation: false,
            open_round: None,
            usage: TokenUsage::default(),
        }
    }

    /// Uses an existing publisher instead of a fresh one.
    pub fn with_publisher(mut self, publisher: StreamPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn scope(&self) -> &RepoScope {
        &self.scope
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn publisher(&self) -> &StreamPublisher {
        &self.publisher
    }

    /// Token usage accumulated over the current logical turn.
    pub fn usage(&self) -> &TokenUsage {
        &self.usage
    }

    /// Handles a user message or the `clear` command.
    pub async fn handle_input(&mut self, input: TurnInput) -> Result<TurnOutcome, ConversationError> {
        match input {
            TurnInput::Clear => {
                self.clear();
                Ok(TurnOutcome::Cleared)
            }
            TurnInput::User { text } => {
                if self.state == LoopState::ToolsPending {
                    let pending = self.pending_approvals();
                    warn!(scope = %self.scope, pending = ?pending, "User message while awaiting approval");
                    return Err(ConversationError::AwaitingApproval(pending));
                }
                info!(scope = %self.scope, "New turn: {text:.50}");
                self.history.push(Message::user(text));
                self.round = 0;
                self.needs_generation = true;
                self.open_round = None;
                self.usage = TokenUsage::default();
                self.state = LoopState::Generating;
                self.publisher.begin_turn(self.history.clone(), self.state);
                self.drive().await
            }
        }
    }

    /// Records a human decision and resumes a parked turn.
    pub async fn handle_decision(
        &mut self,
        signal: ApprovalSignal,
    ) -> Result<TurnOutcome, ConversationError> {
        let outcome = self.resolver.apply_decision(&mut self.history, &signal);
        if outcome != DecisionOutcome::Applied || self.state != LoopState::ToolsPending {
            debug!(tool_call_id = %signal.tool_call_id, ?outcome, state = ?self.state, "Decision not resuming");
            return Ok(TurnOutcome::Unchanged);
        }
        self.publisher.checkpoint(self.history.clone(), self.state);
        self.drive().await
    }

    fn clear(&mut self) {
        info!(scope = %self.scope, messages = self.history.len(), "Clearing history");
        self.history.clear();
        self.state = LoopState::Idle;
        self.round = 0;
        self.needs_generation = false;
        self.open_round = None;
        self.publisher.begin_turn(Vec::new(), self.state);
        self.publisher.publish(StreamEvent::TurnComplete {
            reason: FinishReason::Cleared,
            rounds: 0,
        });
    }

    fn pending_approvals(&self) -> Vec<String> {
        self.history
            .iter()
            .flat_map(Message::tool_invocations)
            .filter(|inv| inv.is_awaiting_approval())
            .map(|inv| inv.tool_call_id.clone())
            .collect()
    }

    /// Runs rounds until the turn finishes, parks, or the model fails.
    async fn drive(&mut self) -> Result<TurnOutcome, ConversationError> {
        loop {
            let resolution = self.resolve_last().await;
            if resolution.is_suspended() {
                self.state = LoopState::ToolsPending;
                self.publisher.checkpoint(self.history.clone(), self.state);
                self.publisher.publish(StreamEvent::TurnComplete {
                    reason: FinishReason::AwaitingApproval,
                    rounds: self.round,
                });
                info!(scope = %self.scope, pending = ?resolution.awaiting_approval, "Turn parked for approval");
                return Ok(TurnOutcome::AwaitingApproval {
                    tool_call_ids: resolution.awaiting_approval,
                });
            }

            if let Some(round) = self.open_round.take() {
                self.publisher.publish(StreamEvent::StepFinish { round });
            }

            if !self.needs_generation {
                return Ok(self.finish(FinishReason::Stop));
            }
            if self.round >= self.config.max_rounds {
                warn!(
                    scope = %self.scope,
                    max_rounds = self.config.max_rounds,
                    "Round budget exhausted"
                );
                return Ok(self.finish(FinishReason::RoundLimit));
            }

            self.round += 1;
            self.open_round = Some(self.round);
            self.state = LoopState::Generating;
            self.publisher
                .publish(StreamEvent::StepStart { round: self.round });
            self.generate().await?;
        }
    }

    fn finish(&mut self, reason: FinishReason) -> TurnOutcome {
        self.state = LoopState::Done;
        self.needs_generation = false;
        self.publisher.checkpoint(self.history.clone(), self.state);
        self.publisher.publish(StreamEvent::TurnComplete {
            reason,
            rounds: self.round,
        });
        info!(
            scope = %self.scope,
            ?reason,
            rounds = self.round,
            prompt_tokens = self.usage.prompt_tokens,
            completion_tokens = self.usage.completion_tokens,
            "Turn finished"
        );
        TurnOutcome::Finished {
            reason,
            rounds: self.round,
        }
    }

    /// Resolves the trailing assistant message and publishes each result.
    async fn resolve_last(&mut self) -> Resolution {
        let Some(last) = self
            .history
            .last_mut()
            .filter(|m| m.role == Role::Assistant)
        else {
            return Resolution::default();
        };
        let resolution = self.resolver.resolve(last).await;
        for inv in &resolution.completed {
            let (output, error_text) = match &inv.state {
                ToolState::OutputAvailable { output } => (Some(output.clone()), None),
                ToolState::OutputError { error_text } => (None, Some(error_text.clone())),
                ToolState::InputStreaming | ToolState::InputAvailable { .. } => continue,
            };
            self.publisher.publish(StreamEvent::ToolResult {
                tool_call_id: inv.tool_call_id.clone(),
                output,
                error_text,
            });
        }
        resolution
    }

    /// One model call. Failure ends the turn, keeping whatever text streamed.
    async fn generate(&mut self) -> Result<(), ConversationError> {
        let request = ChatRequest {
            messages: history_to_chat_messages(&self.system_prompt, &sanitize_history(&self.history)),
            tools: self.resolver.registry().definitions(),
            model: self.config.model.clone(),
        };
        debug!(scope = %self.scope, round = self.round, messages = request.messages.len(), "LLM call");

        match self.stream_round(request).await {
            Ok(requested_tools) => {
                self.needs_generation = requested_tools;
                Ok(())
            }
            Err(e) => {
                error!(scope = %self.scope, round = self.round, error = %e, "Model call failed");
                self.state = LoopState::Idle;
                self.needs_generation = false;
                self.open_round = None;
                self.drop_unresolved_tail();
                self.publisher.publish(StreamEvent::Error {
                    message: e.to_string(),
                });
                self.publisher.checkpoint(self.history.clone(), self.state);
                Err(e.into())
            }
        }
    }

    /// Streams one model response into the turn's assistant message.
    /// Returns whether the model requested any tool.
    async fn stream_round(&mut self, request: ChatRequest) -> Result<bool, LlmError> {
        let mut stream = self.llm.stream_chat(request).await?;
        let mut ids: HashMap<String, String> = HashMap::new();
        let mut requested_tools = false;

        while let Some(chunk) = stream.next().await {
            match chunk? {
                ModelChunk::TextDelta(delta) => {
                    self.append_text(&delta);
                    self.publisher.publish(StreamEvent::TextDelta { delta });
                }
                ModelChunk::ToolCallStart { id, name } => {
                    self.start_tool_call(id, name, &mut ids);
                    requested_tools = true;
                }
                ModelChunk::ToolCallDelta {
                    id,
                    arguments_delta,
                } => {
                    let tool_call_id = ids.get(&id).cloned().unwrap_or(id);
                    self.publisher.publish(StreamEvent::ToolCallDelta {
                        tool_call_id,
                        input_delta: arguments_delta,
                    });
                }
                ModelChunk::ToolCallReady(call) => {
                    let tool_call_id = match ids.get(&call.id) {
                        Some(id) => id.clone(),
                        None => self.start_tool_call(call.id, call.name.clone(), &mut ids),
                    };
                    self.complete_tool_call(tool_call_id, call.name, call.arguments);
                    requested_tools = true;
                }
                ModelChunk::Finish { usage } => {
                    debug!(
                        prompt_tokens = usage.prompt_tokens,
                        completion_tokens = usage.completion_tokens,
                        "Round usage"
                    );
                    self.usage.add(&usage);
                }
            }
        }
        Ok(requested_tools)
    }

    fn assistant_mut(&mut self) -> &mut Message {
        if !matches!(self.history.last(), Some(m) if m.role == Role::Assistant) {
            self.history.push(Message::assistant());
        }
        let last = self.history.len() - 1;
        &mut self.history[last]
    }

    fn append_text(&mut self, delta: &str) {
        let message = self.assistant_mut();
        if let Some(Part::Text { text }) = message.parts.last_mut() {
            text.push_str(delta);
        } else {
            message.parts.push(Part::text(delta));
        }
    }

    fn is_known_call_id(&self, id: &str) -> bool {
        self.history
            .iter()
            .flat_map(Message::tool_invocations)
            .any(|inv| inv.tool_call_id == id)
    }

    /// Adds a streaming invocation, renaming an id already used in this history.
    fn start_tool_call(
        &mut self,
        model_id: String,
        name: String,
        ids: &mut HashMap<String, String>,
    ) -> String {
        let tool_call_id = if model_id.is_empty() || self.is_known_call_id(&model_id) {
            let fresh = format!("call_{}", Uuid::new_v4().simple());
            if !model_id.is_empty() {
                warn!(model_id = %model_id, renamed = %fresh, "Duplicate tool call id from model");
            }
            fresh
        } else {
            model_id.clone()
        };
        ids.insert(model_id, tool_call_id.clone());
        self.assistant_mut()
            .parts
            .push(Part::ToolInvocation(ToolInvocation::streaming(
                &tool_call_id,
                &name,
            )));
        self.publisher.publish(StreamEvent::ToolCallStart {
            tool_call_id: tool_call_id.clone(),
            tool_name: name,
        });
        tool_call_id
    }

    fn complete_tool_call(&mut self, tool_call_id: String, name: String, arguments: serde_json::Value) {
        let input = self.scope.override_input(arguments);
        let needs_approval = self.resolver.registry().requires_confirmation(&name);
        let approval = needs_approval.then_some(ApprovalStatus::Pending);
        if let Some(inv) = self.assistant_mut().find_tool_invocation_mut(&tool_call_id) {
            inv.input = input.clone();
            inv.state = ToolState::InputAvailable { approval };
        }
        self.publisher.publish(StreamEvent::ToolCallReady {
            tool_call_id: tool_call_id.clone(),
            tool_name: name.clone(),
            input: input.clone(),
        });
        if needs_approval {
            self.publisher.publish(StreamEvent::ApprovalRequested {
                tool_call_id,
                tool_name: name,
                input,
            });
        }
    }

    /// After a failed round, keeps streamed text and resolved calls only.
    fn drop_unresolved_tail(&mut self) {
        let Some(last) = self
            .history
            .last_mut()
            .filter(|m| m.role == Role::Assistant)
        else {
            return;
        };
        last.parts
            .retain(|p| p.as_tool_invocation().is_none_or(ToolInvocation::is_resolved));
        if last.parts.is_empty() {
            self.history.pop();
        }
    }
}
