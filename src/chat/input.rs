//! Input processing
//!
//! Stateless helpers applied to user text before it reaches the model.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{ConversationTurn, Role};

/// Maximum number of characters kept from a user message
pub const MAX_INPUT_CHARS: usize = 512;

static FORBIDDEN_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>\\'"]"#).expect("forbidden character pattern is valid"));

/// Strip markup and quoting characters and cap the length
///
/// Removes every `<`, `>`, `\`, `'` and `"`, then keeps the first
/// [`MAX_INPUT_CHARS`] characters. Never fails; the result may be empty.
pub fn sanitize_input(text: &str) -> String {
    FORBIDDEN_CHARS
        .replace_all(text, "")
        .chars()
        .take(MAX_INPUT_CHARS)
        .collect()
}

/// Render turns as a `User:`/`Assistant:` transcript, oldest first
pub fn format_history(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|turn| {
            format!(
                "{}: {}\n{}: {}",
                Role::User.label(),
                turn.question,
                Role::Assistant.label(),
                turn.answer
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
