//! History repair before a model call.

use proto::{Message, Part};

/// Returns a copy of `history` in which the most recent message carries no
/// trailing incomplete tool invocation. Earlier messages pass through as-is.
///
/// A message whose parts are all stripped is dropped.
pub fn sanitize_history(history: &[Message]) -> Vec<Message> {
    let mut sanitized = history.to_vec();
    let Some(last) = sanitized.last_mut() else {
        return sanitized;
    };

    while let Some(Part::ToolInvocation(inv)) = last.parts.last() {
        if !inv.is_incomplete() {
            break;
        }
        last.parts.pop();
    }

    if last.parts.is_empty() {
        sanitized.pop();
    }
    sanitized
}
