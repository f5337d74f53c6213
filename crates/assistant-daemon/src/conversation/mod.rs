//! Conversation history.
//!
//! The engine writes one entry per completed generation and reads the most
//! recent entries back as prompt context. Cancelled and failed generations
//! are never recorded.

pub mod sqlite;

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use sqlite::SqliteConversationStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub user_text: String,
    pub answer_text: String,
    pub recorded_at: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn new(user_text: impl Into<String>, answer_text: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            answer_text: answer_text.into(),
            recorded_at: Utc::now(),
        }
    }
}

pub trait ConversationStore: Send + Sync {
    fn append(&self, entry: ConversationEntry) -> anyhow::Result<()>;

    /// Up to `limit` most recent entries, oldest first.
    fn recent(&self, limit: usize) -> anyhow::Result<Vec<ConversationEntry>>;

    fn clear(&self) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct InMemoryConversationStore {
    entries: Arc<RwLock<Vec<ConversationEntry>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all(&self) -> Vec<ConversationEntry> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn append(&self, entry: ConversationEntry) -> anyhow::Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| anyhow::anyhow!("conversation store lock poisoned"))?;
        entries.push(entry);
        Ok(())
    }

    fn recent(&self, limit: usize) -> anyhow::Result<Vec<ConversationEntry>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("conversation store lock poisoned"))?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries[skip..].to_vec())
    }

    fn clear(&self) -> anyhow::Result<()> {
        self.entries
            .write()
            .map_err(|_| anyhow::anyhow!("conversation store lock poisoned"))?
            .clear();
        Ok(())
    }
}
