use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orca_core::{Message, Result, Role};

/// A persisted conversation: an append-only transcript plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Case-insensitive keyword match against the title and every message.
    pub fn matches(&self, query: &str) -> bool {
        let needle = query.to_lowercase();
        self.title.to_lowercase().contains(&needle)
            || self
                .messages
                .iter()
                .any(|m| m.content.to_lowercase().contains(&needle))
    }
}

/// Storage strategy for conversation transcripts.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Short name of the storage strategy ("flat", "indexed").
    fn kind(&self) -> &'static str;

    /// Create an empty conversation and return its id.
    async fn create_conversation(&self, title: &str) -> Result<String>;

    /// Append one message. Fails with `ConversationNotFound` for unknown ids.
    async fn add_message(&self, id: &str, role: Role, content: &str) -> Result<()>;

    /// Full transcript, messages in append order.
    async fn get_conversation(&self, id: &str) -> Result<Conversation>;

    /// Conversations ordered most-recently-updated first.
    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>>;

    /// Keyword search over titles and message contents, most recent first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Conversation>> {
        let all = self.list_conversations(usize::MAX).await?;
        Ok(all
            .into_iter()
            .filter(|c| c.matches(query))
            .take(limit)
            .collect())
    }
}
