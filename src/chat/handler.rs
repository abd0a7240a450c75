//! Chat message handling
//!
//! Turns raw user text into a reply, keeping error details out of what the
//! user sees.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::chat::input::sanitize_input;
use crate::inference::ResponseGenerator;

pub const MODEL_READY_MSG: &str = "The model is ready. Ask me anything!";
pub const INVALID_INPUT_MSG: &str = "That input is empty or invalid, please re-enter your question.";
pub const ERROR_MSG: &str = "Sorry, something went wrong while answering. Please try again.";

/// Reply to one user message
#[derive(Debug, Clone, PartialEq)]
pub enum ChatReply {
    Answer { text: String, elapsed: Duration },
    /// Nothing was left after sanitizing
    InvalidInput,
    /// Generation failed; details are only logged
    Failed,
}

impl ChatReply {
    /// Text shown to the user
    pub fn message(&self) -> &str {
        match self {
            ChatReply::Answer { text, .. } => text,
            ChatReply::InvalidInput => INVALID_INPUT_MSG,
            ChatReply::Failed => ERROR_MSG,
        }
    }
}

/// Per-session message handler shared by the front-ends
#[derive(Clone)]
pub struct ChatHandler {
    generator: ResponseGenerator,
}

impl ChatHandler {
    pub fn new(generator: ResponseGenerator) -> Self {
        Self { generator }
    }

    pub fn on_chat_start(&self) -> &'static str {
        MODEL_READY_MSG
    }

    pub async fn on_message(&self, raw: &str) -> ChatReply {
        self.on_message_with_stop(raw, Arc::new(AtomicBool::new(false)))
            .await
    }

    /// Like [`on_message`](Self::on_message); setting `stop` aborts generation
    pub async fn on_message_with_stop(&self, raw: &str, stop: Arc<AtomicBool>) -> ChatReply {
        let question = sanitize_input(raw);
        if question.trim().is_empty() {
            tracing::debug!("Rejected empty input after sanitizing");
            return ChatReply::InvalidInput;
        }

        match self.generator.async_generate_with_stop(&question, stop).await {
            Ok(result) => {
                tracing::info!("Answered in {:.2}s", result.elapsed_seconds());
                ChatReply::Answer {
                    text: result.response,
                    elapsed: result.elapsed,
                }
            }
            Err(e) => {
                tracing::error!("Failed to generate answer: {}", e);
                ChatReply::Failed
            }
        }
    }
}
