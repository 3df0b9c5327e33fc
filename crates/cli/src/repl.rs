//! Line-oriented chat over one repository conversation.

use std::io::Write;

use agent::{ConversationHandle, Delivery, EventSubscription};
use proto::{
    ApprovalDecision, ApprovalSignal, Checkpoint, FinishReason, LoopState, Message, StreamEvent,
    TurnInput,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{debug, warn};

const PREVIEW_CHARS: usize = 200;

type StdinLines = Lines<BufReader<Stdin>>;

/// How a turn segment ended, from the REPL's point of view.
#[derive(Debug, PartialEq, Eq)]
enum SegmentEnd {
    Complete,
    Approval(Vec<String>),
    Failed,
    Closed,
}

/// Reads prompts from stdin until EOF or `exit`.
pub async fn run(handle: ConversationHandle) -> anyhow::Result<()> {
    let (_checkpoint, mut events) = handle.attach();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!(
        "Chatting about {}. Type `clear` to reset, `exit` to quit.",
        handle.scope()
    );

    loop {
        prompt("> ")?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
            break;
        }

        handle.submit(TurnInput::from_text(line)).await?;
        loop {
            match read_segment(&mut events).await {
                SegmentEnd::Approval(ids) => {
                    for id in ids {
                        let decision = ask_decision(&mut lines, &id).await?;
                        debug!(tool_call_id = %id, ?decision, "Approval decided");
                        handle.decide(ApprovalSignal::new(id, decision)).await?;
                    }
                }
                SegmentEnd::Complete | SegmentEnd::Failed => break,
                SegmentEnd::Closed => {
                    warn!("Conversation stopped");
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

/// Prints events until the loop hands control back.
async fn read_segment(events: &mut EventSubscription) -> SegmentEnd {
    let mut pending = Vec::new();
    while let Some(delivery) = events.recv().await {
        let sequenced = match delivery {
            Delivery::Event(sequenced) => sequenced,
            Delivery::Resync(checkpoint) => {
                println!("\n[output skipped; resumed at event {}]", checkpoint.seq);
                match resync_end(&checkpoint) {
                    Some(end) => return end,
                    None => continue,
                }
            }
        };
        if let StreamEvent::ApprovalRequested { tool_call_id, .. } = &sequenced.event {
            pending.push(tool_call_id.clone());
        }
        if let Some(text) = render_event(&sequenced.event) {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        match sequenced.event {
            StreamEvent::TurnComplete {
                reason: FinishReason::AwaitingApproval,
                ..
            } => return SegmentEnd::Approval(std::mem::take(&mut pending)),
            StreamEvent::TurnComplete { .. } => return SegmentEnd::Complete,
            StreamEvent::Error { .. } => return SegmentEnd::Failed,
            _ => {}
        }
    }
    SegmentEnd::Closed
}

/// Where a resync leaves the REPL. `None` while the loop is still generating.
fn resync_end(checkpoint: &Checkpoint) -> Option<SegmentEnd> {
    match checkpoint.state {
        LoopState::Generating => None,
        LoopState::ToolsPending => Some(SegmentEnd::Approval(
            checkpoint
                .messages
                .iter()
                .flat_map(Message::tool_invocations)
                .filter(|inv| inv.is_awaiting_approval())
                .map(|inv| inv.tool_call_id.clone())
                .collect(),
        )),
        LoopState::Idle | LoopState::Done => Some(SegmentEnd::Complete),
    }
}

async fn ask_decision(lines: &mut StdinLines, tool_call_id: &str) -> anyhow::Result<ApprovalDecision> {
    loop {
        prompt(&format!("Allow {tool_call_id}? [y/n] "))?;
        let Some(answer) = lines.next_line().await? else {
            return Ok(ApprovalDecision::No);
        };
        if let Some(decision) = parse_decision(&answer) {
            return Ok(decision);
        }
    }
}

fn prompt(text: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{text}")?;
    stdout.flush()
}

fn parse_decision(answer: &str) -> Option<ApprovalDecision> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(ApprovalDecision::Yes),
        "n" | "no" => Some(ApprovalDecision::No),
        _ => None,
    }
}

/// Terminal rendering of one event. `None` for events with nothing to show.
fn render_event(event: &StreamEvent) -> Option<String> {
    match event {
        StreamEvent::TextDelta { delta } => Some(delta.clone()),
        StreamEvent::ToolCallReady {
            tool_name, input, ..
        } => Some(format!("\n[tool] {tool_name} {}\n", preview(input))),
        StreamEvent::ApprovalRequested {
            tool_call_id,
            tool_name,
            input,
        } => Some(format!(
            "\n[approval] {tool_name} ({tool_call_id}) wants to run with {}\n",
            preview(input)
        )),
        StreamEvent::ToolResult {
            error_text: Some(error),
            ..
        } => Some(format!("[tool error] {error}\n")),
        StreamEvent::ToolResult {
            output: Some(output),
            ..
        } => Some(format!("[result] {}\n", preview(output))),
        StreamEvent::TurnComplete {
            reason: FinishReason::RoundLimit,
            rounds,
        } => Some(format!("\n[stopped after {rounds} rounds]\n")),
        StreamEvent::TurnComplete {
            reason: FinishReason::Cleared,
            ..
        } => Some("[conversation cleared]\n".to_string()),
        StreamEvent::TurnComplete {
            reason: FinishReason::Stop,
            ..
        } => Some("\n".to_string()),
        StreamEvent::Error { message } => Some(format!("\n[error] {message}\n")),
        _ => None,
    }
}

fn preview(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}
