//! Chat history store

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use super::{DbConn, DbPool};
use crate::session::{Message, Role};
use crate::{Error, Result};

/// Characters of the first user message kept as the chat title
const TITLE_CHARS: usize = 60;

/// Append and ordered-read access to persisted conversations
pub trait HistoryStore: Send + Sync {
    /// Append a completed message, creating the chat on first use
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    fn append(&self, chat_id: &str, role: Role, content: &str, at: DateTime<Utc>) -> Result<()>;

    /// The `limit` most recent messages of a chat, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if the read fails
    fn recent(&self, chat_id: &str, limit: usize) -> Result<Vec<StoredMessage>>;
}

/// A persisted message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A chat row with its message count
#[derive(Debug, Clone)]
pub struct ChatSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Convert stored messages into session context
///
/// Tool results are dropped along with empty messages, since the assistant
/// calls they answered are not persisted.
#[must_use]
pub fn replay(stored: Vec<StoredMessage>) -> Vec<Message> {
    stored
        .into_iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant) && !m.content.trim().is_empty())
        .map(|m| {
            let mut message = match m.role {
                Role::User => Message::user(m.content),
                _ => Message::assistant(m.content),
            };
            message.created_at = m.created_at;
            message
        })
        .collect()
}

/// `SQLite`-backed history
#[derive(Clone)]
pub struct SqliteHistory {
    pool: DbPool,
}

impl SqliteHistory {
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<DbConn> {
        self.pool.get().map_err(|e| Error::Database(e.to_string()))
    }

    /// Most recently updated chat
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn latest_chat(&self) -> Result<Option<String>> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "SELECT id FROM chats ORDER BY updated_at DESC, rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Recent chats, newest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_chats(&self, limit: usize) -> Result<Vec<ChatSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.title, c.created_at, c.updated_at, COUNT(m.id)
             FROM chats c LEFT JOIN messages m ON m.chat_id = c.id
             GROUP BY c.id
             ORDER BY c.updated_at DESC, c.rowid DESC
             LIMIT ?1",
        )?;

        #[allow(clippy::cast_possible_wrap)]
        let chats = stmt
            .query_map([limit as i64], |row| {
                Ok(ChatSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: parse_datetime(&row.get::<_, String>(2)?),
                    updated_at: parse_datetime(&row.get::<_, String>(3)?),
                    message_count: usize::try_from(row.get::<_, i64>(4)?).unwrap_or(0),
                })
            })?
            .filter_map(std::result::Result::ok)
            .collect();

        Ok(chats)
    }

    /// Every message of a chat, oldest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn messages(&self, chat_id: &str) -> Result<Vec<StoredMessage>> {
        self.recent(chat_id, usize::MAX >> 1)
    }
}

impl HistoryStore for SqliteHistory {
    fn append(&self, chat_id: &str, role: Role, content: &str, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let at = format_datetime(at);

        tx.execute(
            "INSERT OR IGNORE INTO chats (id, title, created_at, updated_at) VALUES (?1, '', ?2, ?2)",
            params![chat_id, at],
        )?;
        if role == Role::User {
            tx.execute(
                "UPDATE chats SET title = ?1 WHERE id = ?2 AND title = ''",
                params![title_from(content), chat_id],
            )?;
        }
        tx.execute(
            "INSERT INTO messages (id, chat_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![Uuid::new_v4().to_string(), chat_id, role.as_str(), content, at],
        )?;
        tx.execute(
            "UPDATE chats SET updated_at = ?1 WHERE id = ?2",
            params![at, chat_id],
        )?;
        tx.commit()?;

        tracing::trace!(chat_id, role = role.as_str(), "message persisted");
        Ok(())
    }

    fn recent(&self, chat_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, role, content, created_at
             FROM messages WHERE chat_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut messages: Vec<StoredMessage> = stmt
            .query_map(params![chat_id, limit], |row| {
                Ok(StoredMessage {
                    id: row.get(0)?,
                    chat_id: row.get(1)?,
                    role: Role::parse(&row.get::<_, String>(2)?).unwrap_or(Role::User),
                    content: row.get(3)?,
                    created_at: parse_datetime(&row.get::<_, String>(4)?),
                })
            })?
            .filter_map(std::result::Result::ok)
            .collect();

        // Reverse to get chronological order
        messages.reverse();
        Ok(messages)
    }
}

fn title_from(content: &str) -> String {
    let line = content.lines().next().unwrap_or_default().trim();
    line.chars().take(TITLE_CHARS).collect()
}

/// Fixed-width UTC timestamps so text ordering matches time ordering
fn format_datetime(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
