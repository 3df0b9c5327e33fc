use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use agent::{
    ChatRequest, ChatRole, Conversation, ConversationConfig, LlmProvider, ModelChunk, ModelStream,
    ToolRegistry, TokenUsage, TurnOutcome, sanitize_history, spawn_conversation,
};
use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use proto::{
    ApprovalSignal, ConversationError, DECLINED_OUTPUT, FinishReason, LlmError, LoopState,
    SequencedEvent, StreamEvent, ToolCall, ToolError, ToolState, TurnInput,
};
use serde_json::{Value, json};
use tokio::time::{Duration, timeout};
use tools::RepoScope;

/// Replays scripted responses; once the script runs out it either fails or
/// keeps requesting `listDirectoryContents`.
struct ScriptedLlm {
    script: Mutex<VecDeque<Vec<ModelChunk>>>,
    requests: Mutex<Vec<ChatRequest>>,
    always_call_tool: bool,
}

impl ScriptedLlm {
    fn new(script: Vec<Vec<ModelChunk>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::from(script)),
            requests: Mutex::new(Vec::new()),
            always_call_tool: false,
        })
    }

    fn tool_loop() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            always_call_tool: true,
        })
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("lock requests").clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn stream_chat(&self, req: ChatRequest) -> Result<ModelStream, LlmError> {
        let n = {
            let mut requests = self.requests.lock().expect("lock requests");
            requests.push(req);
            requests.len()
        };
        let next = self.script.lock().expect("lock script").pop_front();
        let chunks = match next {
            Some(chunks) => chunks,
            None if self.always_call_tool => list_dir_call(&format!("loop_{n}"), ""),
            None => return Err(LlmError::InvalidResponse("script exhausted".to_string())),
        };
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }
}

/// In-memory stand-in for the repository tools.
struct FakeRepoTool {
    name: &'static str,
    calls: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl tools::Tool for FakeRepoTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Fake repository tool"
    }

    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {"path": {"type": "string"}}})
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        self.calls.lock().expect("lock calls").push(args.clone());
        match self.name {
            "listDirectoryContents" => Ok(json!([
                {"name": "src", "path": "src", "type": "dir", "size": 0},
                {"name": "Cargo.toml", "path": "Cargo.toml", "type": "file", "size": 512}
            ])),
            "getFileContents" => Ok(json!({"path": args["path"], "content": "fn main() {}"})),
            _ => Err(ToolError::NotFound(self.name.to_string())),
        }
    }
}

fn text(s: &str) -> ModelChunk {
    ModelChunk::TextDelta(s.to_string())
}

fn finish() -> ModelChunk {
    ModelChunk::Finish {
        usage: TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
        },
    }
}

fn tool_call(id: &str, name: &str, input: Value) -> Vec<ModelChunk> {
    let args = input.to_string();
    let (head, tail) = args.split_at(args.len() / 2);
    vec![
        ModelChunk::ToolCallStart {
            id: id.to_string(),
            name: name.to_string(),
        },
        ModelChunk::ToolCallDelta {
            id: id.to_string(),
            arguments_delta: head.to_string(),
        },
        ModelChunk::ToolCallDelta {
            id: id.to_string(),
            arguments_delta: tail.to_string(),
        },
        ModelChunk::ToolCallReady(ToolCall::new(id, name, input)),
        finish(),
    ]
}

fn list_dir_call(id: &str, path: &str) -> Vec<ModelChunk> {
    tool_call(id, "listDirectoryContents", json!({"path": path}))
}

struct Fixture {
    llm: Arc<ScriptedLlm>,
    calls: Arc<Mutex<Vec<Value>>>,
    conversation: Conversation,
}

fn fixture(llm: Arc<ScriptedLlm>, confirm: &[&str], max_rounds: usize) -> Fixture {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ToolRegistry::new();
    for name in ["listDirectoryContents", "getFileContents"] {
        registry.register(FakeRepoTool {
            name,
            calls: Arc::clone(&calls),
        });
    }
    let mut config = ConversationConfig::new("gpt-4o");
    config.max_rounds = max_rounds;
    config.confirm_tools = confirm.iter().map(|s| s.to_string()).collect();
    let conversation = Conversation::new(
        RepoScope::new("vercel", "next.js"),
        Arc::clone(&llm) as Arc<dyn LlmProvider>,
        registry,
        config,
    );
    Fixture {
        llm,
        calls,
        conversation,
    }
}

fn event_kinds(events: &[SequencedEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e.event {
            StreamEvent::StepStart { .. } => "step-start",
            StreamEvent::TextDelta { .. } => "text-delta",
            StreamEvent::ToolCallStart { .. } => "tool-call-start",
            StreamEvent::ToolCallDelta { .. } => "tool-call-delta",
            StreamEvent::ToolCallReady { .. } => "tool-call-ready",
            StreamEvent::ApprovalRequested { .. } => "approval-requested",
            StreamEvent::ToolResult { .. } => "tool-result",
            StreamEvent::StepFinish { .. } => "step-finish",
            StreamEvent::TurnComplete { .. } => "turn-complete",
            StreamEvent::Error { .. } => "error",
        })
        .collect()
}

/// Checks per-call ordering (start, deltas, ready, result) and that rounds never overlap.
fn assert_well_ordered(events: &[SequencedEvent]) {
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seq must increase");

    let mut stage: HashMap<String, u8> = HashMap::new();
    let mut open_round: Option<usize> = None;
    for e in events {
        match &e.event {
            StreamEvent::StepStart { round } => {
                assert!(open_round.is_none(), "round {round} started while another is open");
                open_round = Some(*round);
            }
            StreamEvent::StepFinish { round } => {
                assert_eq!(open_round, Some(*round));
                open_round = None;
            }
            event => {
                if let Some(id) = event.tool_call_id() {
                    let rank = match event {
                        StreamEvent::ToolCallStart { .. } => 0,
                        StreamEvent::ToolCallDelta { .. } => 1,
                        StreamEvent::ToolCallReady { .. } => 2,
                        StreamEvent::ApprovalRequested { .. } => 3,
                        _ => 4,
                    };
                    let prev = stage.insert(id.to_string(), rank);
                    match rank {
                        0 => assert_eq!(prev, None, "{id} started twice"),
                        _ => assert!(prev.is_some_and(|p| p <= rank), "{id} out of order"),
                    }
                }
            }
        }
    }
}

#[tokio::test]
async fn single_tool_round_then_answer() {
    let llm = ScriptedLlm::new(vec![
        list_dir_call("call_1", ""),
        vec![
            text("The repository has a `src` directory "),
            text("and a Cargo.toml."),
            finish(),
        ],
    ]);
    let Fixture {
        llm,
        calls,
        mut conversation,
    } = fixture(llm, &[], 10);

    let outcome = conversation
        .handle_input(TurnInput::from_text("What files are at the repository root?"))
        .await
        .expect("turn");
    assert_eq!(
        outcome,
        TurnOutcome::Finished {
            reason: FinishReason::Stop,
            rounds: 2
        }
    );
    assert_eq!(conversation.state(), LoopState::Done);
    assert_eq!(calls.lock().expect("calls").len(), 1);
    assert_eq!(calls.lock().expect("calls")[0]["path"], "");

    let history = conversation.history();
    assert_eq!(history.len(), 2);
    let assistant = &history[1];
    let inv = assistant.tool_invocations().next().expect("invocation");
    assert!(matches!(inv.state, ToolState::OutputAvailable { .. }));
    assert_eq!(
        assistant.text(),
        "The repository has a `src` directory and a Cargo.toml."
    );

    let events = conversation.publisher().events();
    assert_eq!(
        event_kinds(&events),
        vec![
            "step-start",
            "tool-call-start",
            "tool-call-delta",
            "tool-call-delta",
            "tool-call-ready",
            "tool-result",
            "step-finish",
            "step-start",
            "text-delta",
            "text-delta",
            "step-finish",
            "turn-complete",
        ]
    );
    assert_well_ordered(&events);

    let second = &llm.requests()[1];
    let roles: Vec<ChatRole> = second.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            ChatRole::System,
            ChatRole::User,
            ChatRole::Assistant,
            ChatRole::Tool
        ]
    );
    assert!(second.messages[3].content.contains("Cargo.toml"));
    assert_eq!(conversation.usage().prompt_tokens, 20);
}

#[tokio::test]
async fn clear_discards_history_without_calling_the_model() {
    let llm = ScriptedLlm::new(vec![vec![text("Hello!"), finish()]]);
    let Fixture {
        llm,
        mut conversation,
        ..
    } = fixture(llm, &[], 10);

    conversation
        .handle_input(TurnInput::from_text("hi"))
        .await
        .expect("turn");
    assert_eq!(conversation.history().len(), 2);

    let outcome = conversation
        .handle_input(TurnInput::from_text("clear"))
        .await
        .expect("clear");
    assert_eq!(outcome, TurnOutcome::Cleared);
    assert!(conversation.history().is_empty());
    assert_eq!(conversation.state(), LoopState::Idle);
    assert_eq!(llm.requests().len(), 1);

    let (checkpoint, _) = conversation.publisher().attach();
    assert!(checkpoint.messages.is_empty());
    let events = conversation.publisher().events();
    assert!(matches!(
        events.last().map(|e| &e.event),
        Some(StreamEvent::TurnComplete {
            reason: FinishReason::Cleared,
            rounds: 0
        })
    ));
}

#[tokio::test]
async fn declined_tool_call_is_reported_to_the_model() {
    let llm = ScriptedLlm::new(vec![
        tool_call("call_f", "getFileContents", json!({"path": "README.md"})),
        vec![text("I could not read the file."), finish()],
    ]);
    let Fixture {
        llm,
        calls,
        mut conversation,
    } = fixture(llm, &["getFileContents"], 10);

    let outcome = conversation
        .handle_input(TurnInput::from_text("Show me the README"))
        .await
        .expect("turn");
    assert_eq!(
        outcome,
        TurnOutcome::AwaitingApproval {
            tool_call_ids: vec!["call_f".to_string()]
        }
    );
    assert_eq!(conversation.state(), LoopState::ToolsPending);
    assert_eq!(llm.requests().len(), 1);

    let kinds = event_kinds(&conversation.publisher().events());
    assert!(kinds.contains(&"approval-requested"));
    assert_eq!(kinds.last(), Some(&"turn-complete"));

    let outcome = conversation
        .handle_decision(ApprovalSignal::deny("call_f"))
        .await
        .expect("resume");
    assert_eq!(
        outcome,
        TurnOutcome::Finished {
            reason: FinishReason::Stop,
            rounds: 2
        }
    );
    assert!(calls.lock().expect("calls").is_empty());

    let second = &llm.requests()[1];
    let tool_msg = second
        .messages
        .iter()
        .find(|m| m.role == ChatRole::Tool)
        .expect("tool result");
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_f"));
    assert_eq!(tool_msg.content, DECLINED_OUTPUT);
    assert_well_ordered(&conversation.publisher().events());
}

#[tokio::test]
async fn approved_tool_call_runs_after_decision() {
    let llm = ScriptedLlm::new(vec![
        tool_call("call_f", "getFileContents", json!({"path": "src/main.rs"})),
        vec![text("It prints nothing."), finish()],
    ]);
    let Fixture {
        calls,
        mut conversation,
        ..
    } = fixture(llm, &["getFileContents"], 10);

    conversation
        .handle_input(TurnInput::from_text("What does main do?"))
        .await
        .expect("turn");
    assert!(calls.lock().expect("calls").is_empty());

    conversation
        .handle_decision(ApprovalSignal::approve("call_f"))
        .await
        .expect("resume");
    assert_eq!(calls.lock().expect("calls").len(), 1);
    assert_eq!(conversation.state(), LoopState::Done);
}

#[tokio::test]
async fn round_budget_caps_model_calls() {
    let Fixture {
        llm,
        mut conversation,
        ..
    } = fixture(ScriptedLlm::tool_loop(), &[], 10);

    let outcome = conversation
        .handle_input(TurnInput::from_text("Explore everything"))
        .await
        .expect("budget exhaustion is not an error");
    assert_eq!(
        outcome,
        TurnOutcome::Finished {
            reason: FinishReason::RoundLimit,
            rounds: 10
        }
    );
    assert_eq!(llm.requests().len(), 10);

    // The last round's call was still resolved.
    let assistant = &conversation.history()[1];
    assert_eq!(assistant.tool_invocations().count(), 10);
    assert!(assistant.tool_invocations().all(|inv| inv.is_resolved()));

    let events = conversation.publisher().events();
    let starts = events
        .iter()
        .filter(|e| matches!(e.event, StreamEvent::StepStart { .. }))
        .count();
    assert_eq!(starts, 10);
    assert_well_ordered(&events);
}

#[tokio::test]
async fn tool_call_ids_stay_unique_across_turns() {
    let llm = ScriptedLlm::new(vec![
        list_dir_call("call_1", ""),
        vec![text("first"), finish()],
        list_dir_call("call_1", "src"),
        vec![text("second"), finish()],
    ]);
    let Fixture {
        mut conversation, ..
    } = fixture(llm, &[], 10);

    for question in ["root?", "src?"] {
        conversation
            .handle_input(TurnInput::from_text(question))
            .await
            .expect("turn");
    }

    let ids: Vec<String> = conversation
        .history()
        .iter()
        .flat_map(|m| m.tool_invocations())
        .map(|inv| inv.tool_call_id.clone())
        .collect();
    assert_eq!(ids.len(), 2);
    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), 2);
}

#[tokio::test]
async fn sanitized_history_never_ends_in_incomplete_call() {
    let llm = ScriptedLlm::new(vec![tool_call(
        "call_f",
        "getFileContents",
        json!({"path": "a"}),
    )]);
    let Fixture {
        mut conversation, ..
    } = fixture(llm, &["getFileContents"], 10);
    conversation
        .handle_input(TurnInput::from_text("read a"))
        .await
        .expect("turn");

    let sanitized = sanitize_history(conversation.history());
    let last = sanitized.last().expect("message");
    assert!(last.tool_invocations().all(|inv| !inv.is_incomplete()));
    assert_eq!(sanitize_history(&sanitized), sanitized);
}

#[tokio::test]
async fn actor_streams_turn_to_attached_subscriber() {
    let llm = ScriptedLlm::new(vec![
        list_dir_call("call_1", ""),
        vec![text("done"), finish()],
    ]);
    let Fixture { conversation, .. } = fixture(llm, &[], 10);
    let handle = spawn_conversation(conversation);
    assert_eq!(handle.scope().full_name(), "vercel/next.js");

    let (checkpoint, mut events) = handle.attach();
    assert!(checkpoint.messages.is_empty());

    handle
        .submit(TurnInput::from_text("root?"))
        .await
        .expect("submit");

    let mut received = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(5), events.recv_event())
            .await
            .expect("event in time")
            .expect("stream open");
        let done = matches!(event.event, StreamEvent::TurnComplete { .. });
        received.push(event);
        if done {
            break;
        }
    }
    assert_well_ordered(&received);
    assert!(matches!(
        received.last().map(|e| &e.event),
        Some(StreamEvent::TurnComplete {
            reason: FinishReason::Stop,
            ..
        })
    ));

    let (checkpoint, _) = handle.attach();
    assert_eq!(checkpoint.state, LoopState::Done);
    assert_eq!(checkpoint.messages.len(), 2);
}

#[tokio::test]
async fn actor_reports_command_outcomes_to_the_submitter() {
    let llm = ScriptedLlm::new(vec![
        tool_call("call_f", "getFileContents", json!({"path": "src/main.rs"})),
        vec![text("It prints nothing."), finish()],
    ]);
    let Fixture { conversation, .. } = fixture(llm, &["getFileContents"], 10);
    let handle = spawn_conversation(conversation);

    // The second message is handled while the first turn waits for approval.
    let first = handle
        .submit(TurnInput::from_text("What does main do?"))
        .await
        .expect("submit");
    let second = handle
        .submit(TurnInput::from_text("And lib.rs?"))
        .await
        .expect("submit");

    let parked = timeout(Duration::from_secs(5), first.outcome())
        .await
        .expect("outcome in time")
        .expect("first turn");
    assert_eq!(
        parked,
        TurnOutcome::AwaitingApproval {
            tool_call_ids: vec!["call_f".to_string()]
        }
    );

    let rejected = timeout(Duration::from_secs(5), second.outcome())
        .await
        .expect("outcome in time");
    assert!(matches!(
        rejected,
        Err(ConversationError::AwaitingApproval(ref ids)) if *ids == vec!["call_f".to_string()]
    ));

    let resumed = handle
        .decide(ApprovalSignal::approve("call_f"))
        .await
        .expect("decide")
        .outcome()
        .await
        .expect("resume");
    assert!(matches!(
        resumed,
        TurnOutcome::Finished {
            reason: FinishReason::Stop,
            ..
        }
    ));
}
