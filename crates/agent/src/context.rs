//! Conversion of part-based history into provider chat messages.

use proto::{Message, Part, Role, ToolCall, ToolInvocation, ToolState};
use serde_json::Value;

use crate::llm::ChatMessage;

pub(crate) const MAX_TOOL_RESULT_CHARS: usize = 16_000;

#[derive(Default)]
struct Step<'a> {
    text: String,
    calls: Vec<&'a ToolInvocation>,
}

impl<'a> Step<'a> {
    fn flush_into(&mut self, out: &mut Vec<ChatMessage>) {
        let step = std::mem::take(self);
        if step.text.is_empty() && step.calls.is_empty() {
            return;
        }
        let mut assistant = ChatMessage::assistant(step.text);
        if !step.calls.is_empty() {
            assistant.tool_calls = Some(
                step.calls
                    .iter()
                    .map(|inv| ToolCall::new(&inv.tool_call_id, &inv.tool_name, inv.input.clone()))
                    .collect(),
            );
        }
        out.push(assistant);
        for inv in step.calls {
            let content = truncate_tool_result(&tool_result_text(inv), MAX_TOOL_RESULT_CHARS);
            out.push(ChatMessage::tool_result(&inv.tool_call_id, content));
        }
    }
}

/// Converts history into model input messages, system prompt first.
///
/// Each assistant message is split into steps: a step is its text followed by
/// the calls made after it, and a new step begins when text follows a call.
/// Only resolved invocations are sent.
pub fn history_to_chat_messages(system_prompt: &str, history: &[Message]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system_prompt)];
    for msg in history {
        match msg.role {
            Role::User => messages.push(ChatMessage::user(msg.text())),
            Role::Assistant => {
                let mut step = Step::default();
                for part in &msg.parts {
                    match part {
                        Part::Text { text } => {
                            if !step.calls.is_empty() {
                                step.flush_into(&mut messages);
                            }
                            step.text.push_str(text);
                        }
                        Part::ToolInvocation(inv) if inv.is_resolved() => step.calls.push(inv),
                        Part::ToolInvocation(_) => {}
                    }
                }
                step.flush_into(&mut messages);
            }
            Role::System => {} // skip stored system messages
        }
    }
    messages
}

fn tool_result_text(inv: &ToolInvocation) -> String {
    match &inv.state {
        ToolState::OutputAvailable {
            output: Value::String(s),
        } => s.clone(),
        ToolState::OutputAvailable { output } => output.to_string(),
        ToolState::OutputError { error_text } => error_text.clone(),
        ToolState::InputStreaming | ToolState::InputAvailable { .. } => String::new(),
    }
}

/// Truncates a tool result to at most `max_chars` characters.
/// If the result is longer, it appends a note with how many characters were cut.
pub(crate) fn truncate_tool_result(output: &str, max_chars: usize) -> String {
    let total_chars = output.chars().count();
    if total_chars <= max_chars {
        return output.to_string();
    }

    let kept = output.chars().take(max_chars).collect::<String>();
    let cut = total_chars - max_chars;
    format!("{kept}\n...[output truncated: {cut} chars omitted]")
}

#[cfg(test)]
mod tests {
    use proto::{ApprovalStatus, DECLINED_OUTPUT};
    use serde_json::json;

    use super::*;
    use crate::llm::ChatRole;

    fn done(id: &str, output: Value) -> Part {
        Part::ToolInvocation(ToolInvocation {
            state: ToolState::OutputAvailable { output },
            ..ToolInvocation::available(id, "listDirectoryContents", json!({"path": ""}))
        })
    }

    fn failed(id: &str, error: &str) -> Part {
        Part::ToolInvocation(ToolInvocation {
            state: ToolState::OutputError {
                error_text: error.to_string(),
            },
            ..ToolInvocation::available(id, "getFileContents", json!({"path": "x"}))
        })
    }

    fn assistant(parts: Vec<Part>) -> Message {
        let mut msg = Message::assistant();
        msg.parts = parts;
        msg
    }

    #[test]
    fn system_prompt_comes_first_and_stored_system_entries_are_skipped() {
        let history = vec![
            Message::new(Role::System, vec![Part::text("stored")]),
            Message::user("hello"),
        ];
        let out = history_to_chat_messages("sys", &history);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, ChatRole::System);
        assert_eq!(out[0].content, "sys");
        assert_eq!(out[1].role, ChatRole::User);
        assert_eq!(out[1].content, "hello");
    }

    #[test]
    fn assistant_message_is_split_into_steps() {
        let history = vec![assistant(vec![
            Part::text("Let me look."),
            done("a", json!([{"name": "src"}])),
            Part::text("Now the readme."),
            done("b", json!("# Title")),
            Part::text("It is a CLI."),
        ])];
        let out = history_to_chat_messages("sys", &history);
        let roles: Vec<ChatRole> = out.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                ChatRole::System,
                ChatRole::Assistant,
                ChatRole::Tool,
                ChatRole::Assistant,
                ChatRole::Tool,
                ChatRole::Assistant,
            ]
        );
        assert_eq!(out[1].content, "Let me look.");
        let calls = out[1].tool_calls.as_ref().expect("calls");
        assert_eq!(calls[0].id, "a");
        assert_eq!(out[2].tool_call_id.as_deref(), Some("a"));
        assert_eq!(out[2].content, r#"[{"name":"src"}]"#);
        assert_eq!(out[4].content, "# Title");
        assert_eq!(out[5].content, "It is a CLI.");
        assert!(out[5].tool_calls.is_none());
    }

    #[test]
    fn unresolved_invocations_are_not_sent() {
        let pending = Part::ToolInvocation(ToolInvocation {
            state: ToolState::InputAvailable {
                approval: Some(ApprovalStatus::Pending),
            },
            ..ToolInvocation::available("p", "getFileContents", json!({}))
        });
        let history = vec![assistant(vec![Part::text("x"), pending])];
        let out = history_to_chat_messages("sys", &history);
        assert_eq!(out.len(), 2);
        assert!(out[1].tool_calls.is_none());
    }

    #[test]
    fn errors_and_declines_are_visible_to_the_model() {
        let history = vec![assistant(vec![
            failed("e", "Not found: README.md"),
            done("d", json!(DECLINED_OUTPUT)),
        ])];
        let out = history_to_chat_messages("sys", &history);
        assert_eq!(out[1].tool_calls.as_ref().expect("calls").len(), 2);
        assert_eq!(out[2].content, "Not found: README.md");
        assert_eq!(out[3].content, DECLINED_OUTPUT);
    }

    #[test]
    fn long_tool_output_is_truncated() {
        let big = "x".repeat(MAX_TOOL_RESULT_CHARS + 10);
        let history = vec![assistant(vec![done("a", Value::String(big))])];
        let out = history_to_chat_messages("sys", &history);
        assert!(out[2].content.ends_with("[output truncated: 10 chars omitted]"));
    }

    #[test]
    fn truncate_tool_result_multibyte_is_utf8_safe() {
        let input = "가나다라마바사";
        let out = truncate_tool_result(input, 3);
        assert!(out.starts_with("가나다"));
        assert!(out.contains("4 chars omitted"));
    }

    #[test]
    fn truncate_tool_result_empty_input() {
        assert_eq!(truncate_tool_result("", 10), "");
    }
}
