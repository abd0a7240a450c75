//! Message types
//!
//! Defines conversation roles and question/answer turns.

use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Message from the user
    User,
    /// Message from the AI assistant
    Assistant,
}

impl Role {
    /// Label used when rendering transcripts and prompts
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// A single question/answer exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// What the user asked
    pub question: String,
    /// What the assistant answered
    pub answer: String,
}

impl ConversationTurn {
    pub fn new(question: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            answer: answer.into(),
        }
    }
}

impl<Q: Into<String>, A: Into<String>> From<(Q, A)> for ConversationTurn {
    fn from((question, answer): (Q, A)) -> Self {
        Self::new(question, answer)
    }
}
