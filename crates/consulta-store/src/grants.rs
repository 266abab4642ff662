use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use consulta_core::ids::{GrantId, TemplateId, UserId};
use consulta_core::types::{GrantSource, GrantStatus, Tier};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::usage::{self, UsageRow};

/// One issued license held by a user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GrantRow {
    pub id: GrantId,
    pub user_id: UserId,
    pub template_id: TemplateId,
    pub template_name: String,
    pub tier: Tier,
    pub hours_remaining: Decimal,
    pub status: GrantStatus,
    pub source: GrantSource,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl GrantRow {
    /// Whether the grant has run out of time or hours as of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        is_stale(self.hours_remaining, self.expires_at, now)
    }
}

fn is_stale(hours: Decimal, expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    hours <= Decimal::ZERO || expires_at.is_some_and(|exp| now >= exp)
}

#[derive(Clone, Debug)]
pub struct NewGrant {
    pub user_id: UserId,
    pub template_id: TemplateId,
    pub hours: Decimal,
    pub source: GrantSource,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum IssueOutcome {
    Issued(GrantRow),
    /// The user already holds a usable grant; nothing was written.
    ActiveExists(GrantRow),
    /// A trial was requested but the user already had one at some point.
    TrialClaimed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DebitOutcome {
    Debited { grant: GrantRow, usage: UsageRow },
    Insufficient { remaining: Decimal },
    NoGrant,
}

const SELECT_COLUMNS: &str = "SELECT g.id, g.user_id, g.template_id, t.name, t.tier, g.hours_remaining,
        g.status, g.source, g.issued_at, g.expires_at
 FROM license_grants g JOIN license_templates t ON t.id = g.template_id";

pub struct GrantRepo {
    db: Database,
}

impl GrantRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(grant_id = %id))]
    pub fn get(&self, id: &GrantId) -> Result<GrantRow, StoreError> {
        self.db.with_conn(|conn| {
            query_one(conn, &format!("{SELECT_COLUMNS} WHERE g.id = ?1"), id.as_str())?
                .ok_or_else(|| StoreError::NotFound(format!("grant {id}")))
        })
    }

    /// Expire the user's stale grants, then return the newest usable one.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn resolve_active(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<GrantRow>, StoreError> {
        self.db.with_tx(|tx| {
            expire_stale_in(tx, Some(user_id), now)?;
            select_active(tx, user_id)
        })
    }

    /// Insert a grant unless the user already holds a usable one.
    /// With `once_per_user_source`, also refuses if any grant with the same source ever existed.
    #[instrument(skip(self, grant), fields(user_id = %grant.user_id, source = %grant.source))]
    pub fn issue(
        &self,
        grant: NewGrant,
        once_per_user_source: bool,
        now: DateTime<Utc>,
    ) -> Result<IssueOutcome, StoreError> {
        self.db.with_tx(|tx| {
            if once_per_user_source && has_source(tx, &grant.user_id, grant.source)? {
                return Ok(IssueOutcome::TrialClaimed);
            }

            expire_stale_in(tx, Some(&grant.user_id), now)?;
            if let Some(active) = select_active(tx, &grant.user_id)? {
                return Ok(IssueOutcome::ActiveExists(active));
            }

            let id = GrantId::new();
            tx.execute(
                "INSERT INTO license_grants (id, user_id, template_id, hours_remaining, status, source, issued_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    grant.user_id.as_str(),
                    grant.template_id.as_str(),
                    grant.hours.to_string(),
                    grant.source.to_string(),
                    row_helpers::ts(now),
                    grant.expires_at.map(row_helpers::ts),
                ],
            )?;

            let row = query_one(tx, &format!("{SELECT_COLUMNS} WHERE g.id = ?1"), id.as_str())?
                .ok_or_else(|| StoreError::NotFound(format!("grant {id}")))?;
            Ok(IssueOutcome::Issued(row))
        })
    }

    /// Subtract `hours` from the user's active grant and record usage, as one transaction.
    /// Never lets the balance go negative.
    #[instrument(skip(self), fields(user_id = %user_id, hours = %hours))]
    pub fn debit(
        &self,
        user_id: &UserId,
        hours: Decimal,
        now: DateTime<Utc>,
    ) -> Result<DebitOutcome, StoreError> {
        self.db.with_tx(|tx| {
            expire_stale_in(tx, Some(user_id), now)?;
            let Some(mut grant) = select_active(tx, user_id)? else {
                return Ok(DebitOutcome::NoGrant);
            };

            let remaining = grant.hours_remaining - hours;
            if remaining < Decimal::ZERO {
                return Ok(DebitOutcome::Insufficient {
                    remaining: grant.hours_remaining,
                });
            }

            let status = if remaining <= Decimal::ZERO {
                GrantStatus::Expired
            } else {
                GrantStatus::Active
            };
            tx.execute(
                "UPDATE license_grants SET hours_remaining = ?1, status = ?2 WHERE id = ?3",
                rusqlite::params![remaining.to_string(), status.to_string(), grant.id.as_str()],
            )?;
            grant.hours_remaining = remaining;
            grant.status = status;

            let usage = usage::record(tx, user_id, hours, now)?;
            Ok(DebitOutcome::Debited { grant, usage })
        })
    }

    /// Add hours to the user's active grant. Returns `None` if there is none.
    #[instrument(skip(self), fields(user_id = %user_id, hours = %hours))]
    pub fn credit(
        &self,
        user_id: &UserId,
        hours: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Option<GrantRow>, StoreError> {
        self.db.with_tx(|tx| {
            expire_stale_in(tx, Some(user_id), now)?;
            let Some(mut grant) = select_active(tx, user_id)? else {
                return Ok(None);
            };
            grant.hours_remaining += hours;
            tx.execute(
                "UPDATE license_grants SET hours_remaining = ?1 WHERE id = ?2",
                rusqlite::params![grant.hours_remaining.to_string(), grant.id.as_str()],
            )?;
            Ok(Some(grant))
        })
    }

    /// Mark every stale active grant as expired. Returns how many flipped.
    #[instrument(skip(self))]
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_tx(|tx| expire_stale_in(tx, None, now))
    }

    /// Every grant the user ever held, newest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn list_for_user(&self, user_id: &UserId) -> Result<Vec<GrantRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE g.user_id = ?1 ORDER BY g.issued_at DESC, g.rowid DESC"
            ))?;
            let mut rows = stmt.query([user_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_grant(row)?);
            }
            Ok(results)
        })
    }

    pub fn has_source(&self, user_id: &UserId, source: GrantSource) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| has_source(conn, user_id, source))
    }
}

fn has_source(conn: &Connection, user_id: &UserId, source: GrantSource) -> Result<bool, StoreError> {
    let found = conn
        .query_row(
            "SELECT 1 FROM license_grants WHERE user_id = ?1 AND source = ?2 LIMIT 1",
            rusqlite::params![user_id.as_str(), source.to_string()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn expire_stale_in(
    conn: &Connection,
    user_id: Option<&UserId>,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    const T: &str = "license_grants";
    let candidates: Vec<(String, String, Option<String>)> = {
        let (sql, param) = match user_id {
            Some(u) => (
                "SELECT id, hours_remaining, expires_at FROM license_grants
                 WHERE status = 'active' AND user_id = ?1",
                Some(u.as_str()),
            ),
            None => (
                "SELECT id, hours_remaining, expires_at FROM license_grants WHERE status = 'active'",
                None,
            ),
        };
        let mut stmt = conn.prepare(sql)?;
        let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String, Option<String>)> {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        };
        match param {
            Some(p) => stmt.query_map([p], map)?.collect::<Result<Vec<_>, _>>()?,
            None => stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?,
        }
    };

    let mut expired = 0;
    for (id, hours, expires_at) in candidates {
        let hours = row_helpers::parse_decimal(&hours, T, "hours_remaining")?;
        let expires_at = expires_at
            .map(|s| row_helpers::parse_ts(&s, T, "expires_at"))
            .transpose()?;
        if is_stale(hours, expires_at, now) {
            conn.execute(
                "UPDATE license_grants SET status = 'expired' WHERE id = ?1",
                [&id],
            )?;
            debug!(grant_id = %id, "grant expired");
            expired += 1;
        }
    }
    Ok(expired)
}

/// Newest active grant. Callers run the stale sweep first, so every active row is usable.
fn select_active(conn: &Connection, user_id: &UserId) -> Result<Option<GrantRow>, StoreError> {
    query_one(
        conn,
        &format!(
            "{SELECT_COLUMNS} WHERE g.user_id = ?1 AND g.status = 'active'
             ORDER BY g.issued_at DESC, g.rowid DESC LIMIT 1"
        ),
        user_id.as_str(),
    )
}

fn query_one(conn: &Connection, sql: &str, param: &str) -> Result<Option<GrantRow>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([param])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_grant(row)?)),
        None => Ok(None),
    }
}

fn row_to_grant(row: &rusqlite::Row<'_>) -> Result<GrantRow, StoreError> {
    const T: &str = "license_grants";
    let tier: String = row_helpers::get(row, 4, T, "tier")?;
    let hours: String = row_helpers::get(row, 5, T, "hours_remaining")?;
    let status: String = row_helpers::get(row, 6, T, "status")?;
    let source: String = row_helpers::get(row, 7, T, "source")?;
    let issued_at: String = row_helpers::get(row, 8, T, "issued_at")?;
    let expires_at: Option<String> = row_helpers::get_opt(row, 9, T, "expires_at")?;

    Ok(GrantRow {
        id: GrantId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        user_id: UserId::from_raw(row_helpers::get::<String>(row, 1, T, "user_id")?),
        template_id: TemplateId::from_raw(row_helpers::get::<String>(row, 2, T, "template_id")?),
        template_name: row_helpers::get(row, 3, T, "template_name")?,
        tier: row_helpers::parse_enum(&tier, T, "tier")?,
        hours_remaining: row_helpers::parse_decimal(&hours, T, "hours_remaining")?,
        status: row_helpers::parse_enum(&status, T, "status")?,
        source: row_helpers::parse_enum(&source, T, "source")?,
        issued_at: row_helpers::parse_ts(&issued_at, T, "issued_at")?,
        expires_at: expires_at
            .map(|s| row_helpers::parse_ts(&s, T, "expires_at"))
            .transpose()?,
    })
}
