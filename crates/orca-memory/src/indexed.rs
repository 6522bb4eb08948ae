//! Indexed store backed by SQLite.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::store::{Conversation, ConversationStore};
use orca_core::{Message, OrcaError, Result, Role};

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

fn db_err(e: rusqlite::Error) -> OrcaError {
    OrcaError::Persistence(e.to_string())
}

/// Fixed-width UTC timestamps so lexical order matches time order.
fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| OrcaError::Persistence(format!("bad timestamp '{raw}': {e}")))
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening indexed conversation store");
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, seq);
            CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at);
            ",
        )
        .map_err(db_err)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    fn load(conn: &Connection, id: &str) -> Result<Conversation> {
        let header = conn
            .query_row(
                "SELECT title, created_at, updated_at FROM conversations WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;
        let Some((title, created_at, updated_at)) = header else {
            return Err(OrcaError::ConversationNotFound(id.to_string()));
        };

        let mut stmt = conn
            .prepare(
                "SELECT role, content, timestamp FROM messages
                 WHERE conversation_id = ?1 ORDER BY seq ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err)?;

        let mut messages = Vec::new();
        for row in rows {
            let (role, content, timestamp) = row.map_err(db_err)?;
            messages.push(Message {
                role: role.parse()?,
                content,
                timestamp: parse_ts(&timestamp)?,
            });
        }

        Ok(Conversation {
            id: id.to_string(),
            title,
            messages,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    fn ids_by_recency(conn: &Connection, limit: usize) -> Result<Vec<String>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn
            .prepare("SELECT id FROM conversations ORDER BY updated_at DESC, rowid DESC LIMIT ?1")
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![limit], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(ids)
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    fn kind(&self) -> &'static str {
        "indexed"
    }

    async fn create_conversation(&self, title: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = now_ts();
        self.db
            .lock()
            .execute(
                "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![id, title, now],
            )
            .map_err(db_err)?;
        Ok(id)
    }

    async fn add_message(&self, id: &str, role: Role, content: &str) -> Result<()> {
        let now = now_ts();
        let mut conn = self.db.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let updated = tx
            .execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                params![id, now],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(OrcaError::ConversationNotFound(id.to_string()));
        }
        tx.execute(
            "INSERT INTO messages (conversation_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![id, role.as_str(), content, now],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    async fn get_conversation(&self, id: &str) -> Result<Conversation> {
        let conn = self.db.lock();
        Self::load(&conn, id)
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        let conn = self.db.lock();
        Self::ids_by_recency(&conn, limit)?
            .iter()
            .map(|id| Self::load(&conn, id))
            .collect()
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Conversation>> {
        let pattern = format!("%{}%", query.to_lowercase());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.db.lock();
        let ids = {
            let mut stmt = conn
                .prepare(
                    "SELECT c.id FROM conversations c
                     WHERE lower(c.title) LIKE ?1
                        OR EXISTS (SELECT 1 FROM messages m
                                   WHERE m.conversation_id = c.id AND lower(m.content) LIKE ?1)
                     ORDER BY c.updated_at DESC, c.rowid DESC LIMIT ?2",
                )
                .map_err(db_err)?;
            stmt.query_map(params![pattern, limit], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<std::result::Result<Vec<String>, _>>()
                .map_err(db_err)?
        };
        ids.iter().map(|id| Self::load(&conn, id)).collect()
    }
}
