use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use consulta_core::ids::{SessionId, UserId};
use consulta_core::types::SessionType;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    SessionBilled,
    SessionForceClosed,
    GrantIssued,
    GrantCredited,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionBilled => write!(f, "session_billed"),
            Self::SessionForceClosed => write!(f, "session_force_closed"),
            Self::GrantIssued => write!(f, "grant_issued"),
            Self::GrantCredited => write!(f, "grant_credited"),
        }
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_billed" => Ok(Self::SessionBilled),
            "session_force_closed" => Ok(Self::SessionForceClosed),
            "grant_issued" => Ok(Self::GrantIssued),
            "grant_credited" => Ok(Self::GrantCredited),
            other => Err(format!("unknown audit action: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub user_id: UserId,
    pub action: AuditAction,
    pub session_id: Option<SessionId>,
    pub session_type: Option<SessionType>,
    pub duration_secs: Option<i64>,
    pub hours: Option<Decimal>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(user_id: &UserId, action: AuditAction, at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.clone(),
            action,
            session_id: None,
            session_type: None,
            duration_secs: None,
            hours: None,
            detail: None,
            created_at: at,
        }
    }
}

/// Append-only audit trail.
pub struct AuditRepo {
    db: Database,
}

impl AuditRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, record), fields(user_id = %record.user_id, action = %record.action))]
    pub fn append(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log (user_id, action, session_id, session_type, duration_secs, hours, detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    record.user_id.as_str(),
                    record.action.to_string(),
                    record.session_id.as_ref().map(|s| s.as_str().to_string()),
                    record.session_type.map(|t| t.to_string()),
                    record.duration_secs,
                    record.hours.map(|h| h.to_string()),
                    record.detail,
                    row_helpers::ts(record.created_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Audit trail for one user, newest first.
    pub fn list_for_user(&self, user_id: &UserId, limit: u32) -> Result<Vec<AuditRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, action, session_id, session_type, duration_secs, hours, detail, created_at
                 FROM audit_log WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![user_id.as_str(), limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_record(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<AuditRecord, StoreError> {
    const T: &str = "audit_log";
    let action: String = row_helpers::get(row, 1, T, "action")?;
    let session_type: Option<String> = row_helpers::get_opt(row, 3, T, "session_type")?;
    let hours: Option<String> = row_helpers::get_opt(row, 5, T, "hours")?;
    let created_at: String = row_helpers::get(row, 7, T, "created_at")?;

    Ok(AuditRecord {
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 0, T, "user_id")?),
        action: row_helpers::parse_enum(&action, T, "action")?,
        session_id: row_helpers::get_opt::<String>(row, 2, T, "session_id")?.map(SessionId::from_raw),
        session_type: session_type
            .map(|s| row_helpers::parse_enum(&s, T, "session_type"))
            .transpose()?,
        duration_secs: row_helpers::get_opt(row, 4, T, "duration_secs")?,
        hours: hours
            .map(|h| row_helpers::parse_decimal(&h, T, "hours"))
            .transpose()?,
        detail: row_helpers::get_opt(row, 6, T, "detail")?,
        created_at: row_helpers::parse_ts(&created_at, T, "created_at")?,
    })
}
