//! SQLite-backed conversation history.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::{debug, info};

use super::{ConversationEntry, ConversationStore};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    recorded_at TEXT NOT NULL,
    user_message TEXT NOT NULL,
    assistant_response TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_recorded_at ON conversations(recorded_at);
";

pub struct SqliteConversationStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteConversationStore {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening conversation database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            conn.execute_batch(SCHEMA_SQL)?;
        }
        Ok(Self { pool: Arc::new(pool) })
    }

    /// Every pooled `:memory:` connection is its own database, so the pool
    /// is pinned to a single connection.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let conn = pool.get()?;
            conn.execute_batch(SCHEMA_SQL)?;
        }
        Ok(Self { pool: Arc::new(pool) })
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }
}

impl ConversationStore for SqliteConversationStore {
    fn append(&self, entry: ConversationEntry) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO conversations (recorded_at, user_message, assistant_response)
             VALUES (?1, ?2, ?3)",
            params![entry.recorded_at.to_rfc3339(), entry.user_text, entry.answer_text],
        )?;
        debug!("Stored conversation entry {}", conn.last_insert_rowid());
        Ok(())
    }

    fn recent(&self, limit: usize) -> anyhow::Result<Vec<ConversationEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT recorded_at, user_message, assistant_response
             FROM conversations ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let recorded_at: String = row.get(0)?;
            Ok((recorded_at, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (recorded_at, user_text, answer_text) = row?;
            let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            entries.push(ConversationEntry {
                user_text,
                answer_text,
                recorded_at,
            });
        }
        entries.reverse();
        Ok(entries)
    }

    fn clear(&self) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        let removed = conn.execute("DELETE FROM conversations", [])?;
        info!("Cleared {} conversation entries", removed);
        Ok(())
    }
}
