//! Flat-log store: one pretty-printed JSON file per conversation.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{Conversation, ConversationStore};
use orca_core::{Message, OrcaError, Result, Role};

pub struct FlatFileStore {
    dir: PathBuf,
    /// Held across the file write so appends to one file never reorder.
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl FlatFileStore {
    /// Open the store, creating the directory and loading every `*.json` file in it.
    /// Unreadable files are skipped with a warning.
    pub async fn open(dir: &Path) -> Result<Self> {
        info!(?dir, "opening flat conversation store");
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| OrcaError::Persistence(format!("create {}: {e}", dir.display())))?;

        let mut conversations = HashMap::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| OrcaError::Persistence(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OrcaError::Persistence(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_file(&path).await {
                Ok(conv) => {
                    conversations.insert(conv.id.clone(), conv);
                }
                Err(e) => warn!(?path, error = %e, "skipping unreadable conversation file"),
            }
        }
        debug!(count = conversations.len(), "loaded conversations");

        Ok(Self {
            dir: dir.to_path_buf(),
            conversations: Mutex::new(conversations),
        })
    }

    fn file_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn persist(&self, conv: &Conversation) -> Result<()> {
        let json = serde_json::to_vec_pretty(conv)?;
        let path = self.file_for(&conv.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| OrcaError::Persistence(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| OrcaError::Persistence(format!("rename {}: {e}", path.display())))
    }
}

async fn load_file(path: &Path) -> Result<Conversation> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

fn most_recent_first(mut convs: Vec<Conversation>, limit: usize) -> Vec<Conversation> {
    convs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    convs.truncate(limit);
    convs
}

#[async_trait]
impl ConversationStore for FlatFileStore {
    fn kind(&self) -> &'static str {
        "flat"
    }

    async fn create_conversation(&self, title: &str) -> Result<String> {
        let conv = Conversation::new(Uuid::new_v4().to_string(), title);
        let id = conv.id.clone();
        let mut conversations = self.conversations.lock().await;
        self.persist(&conv).await?;
        conversations.insert(id.clone(), conv);
        Ok(id)
    }

    async fn add_message(&self, id: &str, role: Role, content: &str) -> Result<()> {
        let mut conversations = self.conversations.lock().await;
        let conv = conversations
            .get_mut(id)
            .ok_or_else(|| OrcaError::ConversationNotFound(id.to_string()))?;
        let mut updated = conv.clone();
        updated.messages.push(Message::new(role, content));
        updated.updated_at = Utc::now();
        // Memory only changes once the file write succeeded.
        self.persist(&updated).await?;
        *conv = updated;
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation> {
        self.conversations
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| OrcaError::ConversationNotFound(id.to_string()))
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        let all: Vec<Conversation> = self.conversations.lock().await.values().cloned().collect();
        Ok(most_recent_first(all, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_files_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = FlatFileStore::open(dir.path()).await.unwrap();
            let id = store.create_conversation("first").await.unwrap();
            store.add_message(&id, Role::User, "hello").await.unwrap();
            id
        };
        assert!(dir.path().join(format!("{id}.json")).exists());

        let reopened = FlatFileStore::open(dir.path()).await.unwrap();
        let conv = reopened.get_conversation(&id).await.unwrap();
        assert_eq!(conv.title, "first");
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].content, "hello");
    }

    #[tokio::test]
    async fn test_garbage_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        let store = FlatFileStore::open(dir.path()).await.unwrap();
        assert!(store.list_conversations(10).await.unwrap().is_empty());
    }
}
