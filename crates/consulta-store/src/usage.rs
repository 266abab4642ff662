use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use consulta_core::ids::UserId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Cumulative consumption for one user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRow {
    pub user_id: UserId,
    pub hours_used: Decimal,
    pub session_count: u32,
    pub last_session_at: Option<DateTime<Utc>>,
}

impl UsageRow {
    fn empty(user_id: &UserId) -> Self {
        Self {
            user_id: user_id.clone(),
            hours_used: Decimal::ZERO,
            session_count: 0,
            last_session_at: None,
        }
    }
}

pub struct UsageRepo {
    db: Database,
}

impl UsageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Usage for a user; zeroes if nothing was ever recorded.
    pub fn get(&self, user_id: &UserId) -> Result<UsageRow, StoreError> {
        self.db.with_conn(|conn| read(conn, user_id))
    }
}

/// Add one billed session to the user's usage. Runs on the caller's connection so it
/// can join the debit transaction.
pub(crate) fn record(
    conn: &Connection,
    user_id: &UserId,
    hours: Decimal,
    at: DateTime<Utc>,
) -> Result<UsageRow, StoreError> {
    let mut usage = read(conn, user_id)?;
    usage.hours_used += hours;
    usage.session_count += 1;
    usage.last_session_at = Some(at);

    conn.execute(
        "INSERT INTO usage_metrics (user_id, hours_used, session_count, last_session_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET
            hours_used = excluded.hours_used,
            session_count = excluded.session_count,
            last_session_at = excluded.last_session_at",
        rusqlite::params![
            user_id.as_str(),
            usage.hours_used.to_string(),
            usage.session_count,
            row_helpers::ts(at),
        ],
    )?;
    Ok(usage)
}

fn read(conn: &Connection, user_id: &UserId) -> Result<UsageRow, StoreError> {
    const T: &str = "usage_metrics";
    let raw = conn
        .query_row(
            "SELECT hours_used, session_count, last_session_at FROM usage_metrics WHERE user_id = ?1",
            [user_id.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;

    match raw {
        None => Ok(UsageRow::empty(user_id)),
        Some((hours, count, last)) => Ok(UsageRow {
            user_id: user_id.clone(),
            hours_used: row_helpers::parse_decimal(&hours, T, "hours_used")?,
            session_count: count,
            last_session_at: last
                .map(|s| row_helpers::parse_ts(&s, T, "last_session_at"))
                .transpose()?,
        }),
    }
}
