//! Conversation Transcript
//!
//! The running record of one call's conversation. A transcript always starts
//! with exactly one system turn; user and assistant turns are appended after it
//! in arrival order and never rewritten.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The speaker of a single turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One role-tagged message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// An ordered, append-only sequence of turns whose first element is the system
/// instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    /// Creates a fresh transcript holding only the system instruction.
    pub fn new(system_instruction: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::new(Role::System, system_instruction)],
        }
    }

    /// Rebuilds a transcript from persisted turns.
    ///
    /// Records written by older deployments (or by hand) may be missing the
    /// leading system turn or carry extra ones. The leading system turn is
    /// kept if present, otherwise `system_instruction` is prepended; any later
    /// system turns are dropped.
    pub fn from_turns(turns: Vec<Turn>, system_instruction: &str) -> Self {
        let mut iter = turns.into_iter().peekable();
        let head = match iter.peek() {
            Some(turn) if turn.role == Role::System => iter.next(),
            _ => None,
        }
        .unwrap_or_else(|| Turn::new(Role::System, system_instruction));

        let mut rebuilt = Vec::with_capacity(iter.size_hint().0 + 1);
        rebuilt.push(head);
        rebuilt.extend(iter.filter(|turn| turn.role != Role::System));
        Self { turns: rebuilt }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::new(Role::User, content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::new(Role::Assistant, content));
    }

    /// The system instruction at index 0.
    pub fn system_instruction(&self) -> &str {
        &self.turns[0].content
    }

    /// All turns after the system instruction.
    pub fn history(&self) -> &[Turn] {
        &self.turns[1..]
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
