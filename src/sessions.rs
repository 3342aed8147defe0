//! Session and message persistence (SQLite via sqlx).
//!
//! A session's last activity is its newest message's timestamp, falling
//! back to the session's own `updated_at` when it has no messages.
//! Appending a message touches the parent's `updated_at`. Deleting a
//! session cascades to its messages.

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{now_ts, Message, Role, Session, SessionDetail, SessionSummary};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error("export encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("message {id} has unknown role '{role}'")]
    InvalidRole { id: String, role: String },
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Markdown,
}

impl ExportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "json" => Some(ExportFormat::Json),
            "md" => Some(ExportFormat::Markdown),
            _ => None,
        }
    }
}

/// A rendered export, ready to be served as an attachment.
#[derive(Debug, Clone)]
pub struct Export {
    pub filename: String,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create(&self, title: Option<&str>) -> Result<Session> {
        let now = now_ts();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            title: title.map(str::to_string),
            memory: None,
            created_at: now.clone(),
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO sessions (id, title, memory, created_at, updated_at) VALUES (?, ?, NULL, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.title)
        .bind(&session.created_at)
        .bind(&session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(session)
    }

    /// All sessions, most recently active first.
    pub async fn list(&self) -> Result<Vec<SessionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.title, s.created_at,
                   COALESCE(m.last_msg_at, s.updated_at) AS last_activity
            FROM sessions s
            LEFT JOIN (
                SELECT session_id, MAX(created_at) AS last_msg_at
                FROM messages GROUP BY session_id
            ) m ON m.session_id = s.id
            ORDER BY last_activity DESC, s.rowid DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| SessionSummary {
                id: row.get("id"),
                title: row.get("title"),
                created_at: row.get("created_at"),
                last_activity: row.get("last_activity"),
            })
            .collect())
    }

    pub async fn get(&self, session_id: &str) -> Result<Session> {
        let row = sqlx::query(
            "SELECT id, title, memory, created_at, updated_at FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        Ok(Session {
            id: row.get("id"),
            title: row.get("title"),
            memory: row.get("memory"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    pub async fn detail(&self, session_id: &str) -> Result<SessionDetail> {
        let session = self.get(session_id).await?;
        let messages = self.messages(session_id).await?;
        Ok(SessionDetail { session, messages })
    }

    /// Messages of a session, oldest first.
    pub async fn messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, role, content, tokens, created_at FROM messages WHERE session_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// The newest `limit` messages of a session, returned oldest first.
    pub async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, role, content, tokens, created_at FROM (
                SELECT id, role, content, tokens, created_at, rowid AS rid
                FROM messages WHERE session_id = ?
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?
            ) ORDER BY created_at ASC, rid ASC
            "#,
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        tokens: Option<i64>,
    ) -> Result<Message> {
        let mut tx = self.pool.begin().await?;
        let now = now_ts();

        let touched = sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.to_string(),
            tokens,
            created_at: now,
        };
        sqlx::query(
            "INSERT INTO messages (id, session_id, role, content, tokens, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(session_id)
        .bind(role.as_str())
        .bind(&message.content)
        .bind(message.tokens)
        .bind(&message.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message)
    }

    /// Replace the session's long-term memory note. `None` clears it.
    pub async fn set_memory(&self, session_id: &str, memory: Option<&str>) -> Result<Session> {
        let touched = sqlx::query("UPDATE sessions SET memory = ?, updated_at = ? WHERE id = ?")
            .bind(memory)
            .bind(now_ts())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        self.get(session_id).await
    }

    /// Returns false when there was nothing to delete.
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    pub async fn export(&self, session_id: &str, format: ExportFormat) -> Result<Export> {
        let SessionDetail { session, messages } = self.detail(session_id).await?;
        Ok(match format {
            ExportFormat::Json => Export {
                filename: format!("session_{}.json", session.id),
                content_type: "application/json",
                body: serde_json::to_vec(&JsonExport {
                    session: &session,
                    messages: &messages,
                })?,
            },
            ExportFormat::Markdown => Export {
                filename: format!("session_{}.md", session.id),
                content_type: "text/markdown; charset=utf-8",
                body: render_markdown(&session, &messages).into_bytes(),
            },
        })
    }
}

#[derive(Serialize)]
struct JsonExport<'a> {
    session: &'a Session,
    messages: &'a [Message],
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let id: String = row.get("id");
    let raw_role: String = row.get("role");
    let role = Role::parse(&raw_role).ok_or_else(|| SessionError::InvalidRole {
        id: id.clone(),
        role: raw_role,
    })?;
    Ok(Message {
        id,
        role,
        content: row.get("content"),
        tokens: row.get("tokens"),
        created_at: row.get("created_at"),
    })
}

fn render_markdown(session: &Session, messages: &[Message]) -> String {
    let mut out = format!("# Session {}\n\n", session.id);
    if let Some(title) = &session.title {
        out.push_str(&format!("**Title:** {}\n\n", title));
    }
    for m in messages {
        out.push_str(&format!("## {} — {}\n\n{}\n\n", m.role, m.created_at, m.content));
    }
    out
}
