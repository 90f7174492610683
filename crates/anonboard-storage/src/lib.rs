//! Anonboard Storage
//!
//! Append-only SQLite log of relayed anonymous messages

use anyhow::{Context, Result};
use std::path::Path;

pub struct Storage {
    conn: rusqlite::Connection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub content: String,
    pub sender: u64,
    pub timestamp: String,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path.as_ref()).with_context(|| {
            format!("failed to open message log {}", db_path.as_ref().display())
        })?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS message_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT,
                sender INTEGER,
                timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            ",
        )?;

        Ok(Self { conn })
    }

    /// Appends one message and returns its record id. Rows are never updated.
    pub fn append_message(&self, content: &str, sender: u64) -> Result<i64> {
        // SQLite integers are signed; snowflakes fit in the positive half.
        let sender = i64::try_from(sender).context("sender id out of range for message log")?;
        self.conn.execute(
            "INSERT INTO message_history (content, sender) VALUES (?1, ?2)",
            (content, sender),
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn count_messages(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM message_history", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Newest first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<StoredMessage>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT id, content, sender, timestamp
             FROM message_history
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit], |row| {
            let sender: i64 = row.get(2)?;
            Ok(StoredMessage {
                id: row.get(0)?,
                content: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                sender: sender as u64,
                timestamp: row.get(3)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}
