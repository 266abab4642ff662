use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use consulta_core::ids::{GrantId, MessageId, SessionId, UserId};
use consulta_core::types::SessionType;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatStatus {
    Active,
    Closed,
}

impl std::fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for ChatStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown chat status: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Lawyer,
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Lawyer => write!(f, "lawyer"),
            Self::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "lawyer" => Ok(Self::Lawyer),
            "system" => Ok(Self::System),
            other => Err(format!("unknown message role: {other}")),
        }
    }
}

/// Typed session metadata, stored as a JSON column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMetadata {
    pub chat_type: SessionType,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours_consumed_at_close: Option<Decimal>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatSessionRow {
    pub id: SessionId,
    pub user_id: UserId,
    pub grant_id: GrantId,
    pub lawyer_id: Option<UserId>,
    pub status: ChatStatus,
    pub metadata: ChatMetadata,
    pub summary: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ChatSessionRow {
    pub fn chat_type(&self) -> SessionType {
        self.metadata.chat_type
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessageRow {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sequence: u32,
    pub sender_id: UserId,
    pub role: MessageRole,
    pub content: String,
    pub from_cache: bool,
    pub legal_area: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewChatSession {
    /// Pre-assigned id; the meter registry is keyed by it.
    pub id: SessionId,
    pub user_id: UserId,
    pub grant_id: GrantId,
    pub lawyer_id: Option<UserId>,
    pub chat_type: SessionType,
}

#[derive(Clone, Debug)]
pub struct NewMessage {
    pub session_id: SessionId,
    pub sender_id: UserId,
    pub role: MessageRole,
    pub content: String,
    pub from_cache: bool,
    pub legal_area: Option<String>,
}

const SESSION_COLUMNS: &str =
    "SELECT id, user_id, grant_id, lawyer_id, status, metadata, summary, started_at, ended_at FROM chat_sessions";
const MESSAGE_COLUMNS: &str =
    "SELECT id, session_id, sequence, sender_id, role, content, from_cache, legal_area, created_at FROM chat_messages";

pub struct ChatRepo {
    db: Database,
}

impl ChatRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, new), fields(session_id = %new.id, user_id = %new.user_id))]
    pub fn create_session(
        &self,
        new: NewChatSession,
        now: DateTime<Utc>,
    ) -> Result<ChatSessionRow, StoreError> {
        let metadata = ChatMetadata {
            chat_type: new.chat_type,
            last_activity_at: now,
            hours_consumed_at_close: None,
        };
        let metadata_json = serde_json::to_string(&metadata)?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_sessions (id, user_id, grant_id, lawyer_id, chat_type, status, metadata, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7)",
                rusqlite::params![
                    new.id.as_str(),
                    new.user_id.as_str(),
                    new.grant_id.as_str(),
                    new.lawyer_id.as_ref().map(|l| l.as_str().to_string()),
                    new.chat_type.to_string(),
                    metadata_json,
                    row_helpers::ts(now),
                ],
            )?;

            Ok(ChatSessionRow {
                id: new.id,
                user_id: new.user_id,
                grant_id: new.grant_id,
                lawyer_id: new.lawyer_id,
                status: ChatStatus::Active,
                metadata,
                summary: None,
                started_at: now,
                ended_at: None,
            })
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get_session(&self, id: &SessionId) -> Result<ChatSessionRow, StoreError> {
        self.db.with_conn(|conn| get_session(conn, id))
    }

    /// Mark a session closed and record the billed hours in its metadata.
    #[instrument(skip(self, summary), fields(session_id = %id))]
    pub fn close_session(
        &self,
        id: &SessionId,
        summary: &str,
        hours_consumed: Decimal,
        now: DateTime<Utc>,
    ) -> Result<ChatSessionRow, StoreError> {
        self.db.with_tx(|tx| {
            let mut session = get_session(tx, id)?;
            session.status = ChatStatus::Closed;
            session.summary = Some(summary.to_string());
            session.ended_at = Some(now);
            session.metadata.last_activity_at = now;
            session.metadata.hours_consumed_at_close = Some(hours_consumed);

            tx.execute(
                "UPDATE chat_sessions SET status = 'closed', summary = ?1, ended_at = ?2, metadata = ?3 WHERE id = ?4",
                rusqlite::params![
                    summary,
                    row_helpers::ts(now),
                    serde_json::to_string(&session.metadata)?,
                    id.as_str(),
                ],
            )?;
            Ok(session)
        })
    }

    /// Remove a session that never got going (e.g. the meter refused to start it).
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            tx.execute("DELETE FROM chat_messages WHERE session_id = ?1", [id.as_str()])?;
            tx.execute("DELETE FROM chat_sessions WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }

    /// Append a message at the next sequence number and bump the session's activity time.
    #[instrument(skip(self, new), fields(session_id = %new.session_id, role = %new.role))]
    pub fn append_message(
        &self,
        new: NewMessage,
        now: DateTime<Utc>,
    ) -> Result<ChatMessageRow, StoreError> {
        self.db.with_tx(|tx| {
            let mut session = get_session(tx, &new.session_id)?;
            let sequence: u32 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM chat_messages WHERE session_id = ?1",
                [new.session_id.as_str()],
                |row| row.get(0),
            )?;

            let id = MessageId::new();
            tx.execute(
                "INSERT INTO chat_messages (id, session_id, sequence, sender_id, role, content, from_cache, legal_area, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id.as_str(),
                    new.session_id.as_str(),
                    sequence,
                    new.sender_id.as_str(),
                    new.role.to_string(),
                    new.content,
                    new.from_cache,
                    new.legal_area,
                    row_helpers::ts(now),
                ],
            )?;

            session.metadata.last_activity_at = now;
            tx.execute(
                "UPDATE chat_sessions SET metadata = ?1 WHERE id = ?2",
                rusqlite::params![serde_json::to_string(&session.metadata)?, new.session_id.as_str()],
            )?;

            Ok(ChatMessageRow {
                id,
                session_id: new.session_id,
                sequence,
                sender_id: new.sender_id,
                role: new.role,
                content: new.content,
                from_cache: new.from_cache,
                legal_area: new.legal_area,
                created_at: now,
            })
        })
    }

    /// All messages of a session in send order.
    pub fn list_messages(&self, session_id: &SessionId) -> Result<Vec<ChatMessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{MESSAGE_COLUMNS} WHERE session_id = ?1 ORDER BY sequence ASC"))?;
            let rows = stmt.query([session_id.as_str()])?;
            collect_messages(rows)
        })
    }

    /// The last `limit` messages of a session, oldest first.
    pub fn recent_messages(
        &self,
        session_id: &SessionId,
        limit: u32,
    ) -> Result<Vec<ChatMessageRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT * FROM ({MESSAGE_COLUMNS} WHERE session_id = ?1 ORDER BY sequence DESC LIMIT ?2)
                 ORDER BY sequence ASC"
            ))?;
            let rows = stmt.query(rusqlite::params![session_id.as_str(), limit])?;
            collect_messages(rows)
        })
    }
}

fn get_session(conn: &Connection, id: &SessionId) -> Result<ChatSessionRow, StoreError> {
    let mut stmt = conn.prepare(&format!("{SESSION_COLUMNS} WHERE id = ?1"))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_session(row),
        None => Err(StoreError::NotFound(format!("chat session {id}"))),
    }
}

fn collect_messages(mut rows: rusqlite::Rows<'_>) -> Result<Vec<ChatMessageRow>, StoreError> {
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_message(row)?);
    }
    Ok(results)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<ChatSessionRow, StoreError> {
    const T: &str = "chat_sessions";
    let status: String = row_helpers::get(row, 4, T, "status")?;
    let metadata: String = row_helpers::get(row, 5, T, "metadata")?;
    let started_at: String = row_helpers::get(row, 7, T, "started_at")?;
    let ended_at: Option<String> = row_helpers::get_opt(row, 8, T, "ended_at")?;

    Ok(ChatSessionRow {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, T, "user_id")?),
        grant_id: GrantId::from_raw(row_helpers::get::<String>(row, 2, T, "grant_id")?),
        lawyer_id: row_helpers::get_opt::<String>(row, 3, T, "lawyer_id")?.map(UserId::from_raw),
        status: row_helpers::parse_enum(&status, T, "status")?,
        metadata: serde_json::from_str(&metadata).map_err(|e| StoreError::CorruptRow {
            table: T,
            column: "metadata",
            detail: format!("invalid metadata: {e}"),
        })?,
        summary: row_helpers::get_opt(row, 6, T, "summary")?,
        started_at: row_helpers::parse_ts(&started_at, T, "started_at")?,
        ended_at: ended_at
            .map(|s| row_helpers::parse_ts(&s, T, "ended_at"))
            .transpose()?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<ChatMessageRow, StoreError> {
    const T: &str = "chat_messages";
    let role: String = row_helpers::get(row, 4, T, "role")?;
    let created_at: String = row_helpers::get(row, 8, T, "created_at")?;

    Ok(ChatMessageRow {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 1, T, "session_id")?),
        sequence: row_helpers::get(row, 2, T, "sequence")?,
        sender_id: UserId::from_raw(row_helpers::get::<String>(row, 3, T, "sender_id")?),
        role: row_helpers::parse_enum(&role, T, "role")?,
        content: row_helpers::get(row, 5, T, "content")?,
        from_cache: row_helpers::get(row, 6, T, "from_cache")?,
        legal_area: row_helpers::get_opt(row, 7, T, "legal_area")?,
        created_at: row_helpers::parse_ts(&created_at, T, "created_at")?,
    })
}
