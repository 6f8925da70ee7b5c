//! Conversation context: the host-owned, ordered history of a conversation.
//!
//! The [`ConversationContext`] trait is the only way handlers and transforms
//! touch history. Entries are append-only apart from the explicit removal and
//! clear operations; nothing here reorders existing entries.

use std::{fmt, str::FromStr, sync::RwLock};

use {
    chrono::{DateTime, Local},
    serde::{Deserialize, Serialize},
};

use crate::error::Error;

/// Author of a context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(Error::UnknownRole(other.to_string())),
        }
    }
}

/// A single entry in the conversation timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Local>,
}

impl ContextMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Local::now(),
        }
    }
}

/// Context mutation interface supplied by the host.
///
/// Implementations must be safe to share between the stages of one turn;
/// distinct conversations use distinct instances.
pub trait ConversationContext: Send + Sync {
    /// Append an entry at the end of the timeline.
    fn append(&self, role: Role, content: String);

    /// Remove up to `count` of the most recent entries with `role`.
    /// Returns how many were removed.
    fn remove_last(&self, role: Role, count: usize) -> usize;

    /// Replace the content of the most recent entry with `role` in place.
    /// Returns false when no such entry exists.
    fn replace_last(&self, role: Role, content: String) -> bool;

    /// Drop every entry.
    fn clear(&self);

    /// Snapshot of the full timeline, oldest first.
    fn messages(&self) -> Vec<ContextMessage>;
}

/// Vec-backed context used by the CLI and by tests.
#[derive(Debug, Default)]
pub struct InMemoryContext {
    entries: RwLock<Vec<ContextMessage>>,
}

impl InMemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<ContextMessage>) -> Self {
        Self {
            entries: RwLock::new(messages),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ConversationContext for InMemoryContext {
    fn append(&self, role: Role, content: String) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(ContextMessage::new(role, content));
    }

    fn remove_last(&self, role: Role, count: usize) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        let mut idx = entries.len();
        while removed < count && idx > 0 {
            idx -= 1;
            if entries[idx].role == role {
                entries.remove(idx);
                removed += 1;
            }
        }
        removed
    }

    fn replace_last(&self, role: Role, content: String) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.iter_mut().rev().find(|m| m.role == role) {
            Some(entry) => {
                entry.content = content;
                true
            },
            None => false,
        }
    }

    fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn messages(&self) -> Vec<ContextMessage> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
