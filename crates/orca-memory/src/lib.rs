//! # orca-memory
//!
//! Durable conversation transcripts. Two interchangeable strategies sit behind
//! [`ConversationStore`]: a flat log of JSON files and an indexed SQLite database.

pub mod flat;
pub mod indexed;
pub mod store;

pub use flat::FlatFileStore;
pub use indexed::SqliteStore;
pub use store::{Conversation, ConversationStore};

use std::path::Path;
use std::sync::Arc;

use orca_core::{OrcaError, Result};

/// File name of the SQLite database inside the data directory.
pub const INDEXED_DB_FILE: &str = "orca.db";

/// Build the storage strategy named by `kind` ("flat" or "indexed").
pub async fn open_store(kind: &str, data_dir: &Path) -> Result<Arc<dyn ConversationStore>> {
    match kind {
        "flat" => Ok(Arc::new(FlatFileStore::open(data_dir).await?)),
        "indexed" => {
            std::fs::create_dir_all(data_dir)?;
            Ok(Arc::new(SqliteStore::open(&data_dir.join(INDEXED_DB_FILE))?))
        }
        other => Err(OrcaError::Config(format!("unknown memory backend: {other}"))),
    }
}
