use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A cached responder reply keyed by query fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryRow {
    pub fingerprint: String,
    pub query: String,
    pub response: String,
    pub legal_area: Option<String>,
    pub hit_count: u32,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheRead {
    Hit(CacheEntryRow),
    /// Entry existed but was past expiry; it has been deleted.
    Expired,
    Miss,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_hits: u64,
    pub expired: u64,
}

const SELECT_COLUMNS: &str = "SELECT fingerprint, query, response, legal_area, hit_count, last_used_at, expires_at, created_at
 FROM cache_entries";

pub struct CacheRepo {
    db: Database,
}

impl CacheRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Read an entry and account for the hit, evicting it instead if it has expired.
    #[instrument(skip(self), fields(fingerprint = %fingerprint))]
    pub fn read_and_touch(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<CacheRead, StoreError> {
        self.db.with_tx(|tx| {
            let Some(mut entry) = select_one(tx, fingerprint)? else {
                return Ok(CacheRead::Miss);
            };

            if entry.expires_at < now {
                tx.execute("DELETE FROM cache_entries WHERE fingerprint = ?1", [fingerprint])?;
                return Ok(CacheRead::Expired);
            }

            entry.hit_count += 1;
            entry.last_used_at = now;
            tx.execute(
                "UPDATE cache_entries SET hit_count = ?1, last_used_at = ?2 WHERE fingerprint = ?3",
                rusqlite::params![entry.hit_count, row_helpers::ts(now), fingerprint],
            )?;
            Ok(CacheRead::Hit(entry))
        })
    }

    /// Insert or replace an entry. Replacing resets `hit_count` to 1.
    #[instrument(skip(self, entry), fields(fingerprint = %entry.fingerprint))]
    pub fn upsert(&self, entry: &CacheEntryRow) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cache_entries (fingerprint, query, response, legal_area, hit_count, last_used_at, expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    query = excluded.query,
                    response = excluded.response,
                    legal_area = excluded.legal_area,
                    hit_count = 1,
                    last_used_at = excluded.last_used_at,
                    expires_at = excluded.expires_at",
                rusqlite::params![
                    entry.fingerprint,
                    entry.query,
                    entry.response,
                    entry.legal_area,
                    row_helpers::ts(entry.last_used_at),
                    row_helpers::ts(entry.expires_at),
                    row_helpers::ts(entry.created_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Read without touching hit accounting or expiry.
    pub fn peek(&self, fingerprint: &str) -> Result<Option<CacheEntryRow>, StoreError> {
        self.db.with_conn(|conn| select_one(conn, fingerprint))
    }

    pub fn delete(&self, fingerprint: &str) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM cache_entries WHERE fingerprint = ?1", [fingerprint])?;
            Ok(rows > 0)
        })
    }

    /// Delete every entry with `expires_at < now`.
    #[instrument(skip(self))]
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let rows = conn.execute(
                "DELETE FROM cache_entries WHERE expires_at < ?1",
                [row_helpers::ts(now)],
            )?;
            Ok(rows)
        })
    }

    pub fn stats(&self, now: DateTime<Utc>) -> Result<CacheStats, StoreError> {
        self.db.with_conn(|conn| {
            let (entries, total_hits, expired): (i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(hit_count), 0),
                        COALESCE(SUM(CASE WHEN expires_at < ?1 THEN 1 ELSE 0 END), 0)
                 FROM cache_entries",
                [row_helpers::ts(now)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok(CacheStats {
                entries: entries as u64,
                total_hits: total_hits as u64,
                expired: expired as u64,
            })
        })
    }

    /// Most-hit entries first.
    pub fn top(&self, limit: u32) -> Result<Vec<CacheEntryRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} ORDER BY hit_count DESC, last_used_at DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query([limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_entry(row)?);
            }
            Ok(results)
        })
    }
}

fn select_one(conn: &Connection, fingerprint: &str) -> Result<Option<CacheEntryRow>, StoreError> {
    let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE fingerprint = ?1"))?;
    let mut rows = stmt.query([fingerprint])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_entry(row)?)),
        None => Ok(None),
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<CacheEntryRow, StoreError> {
    const T: &str = "cache_entries";
    let last_used_at: String = row_helpers::get(row, 5, T, "last_used_at")?;
    let expires_at: String = row_helpers::get(row, 6, T, "expires_at")?;
    let created_at: String = row_helpers::get(row, 7, T, "created_at")?;

    Ok(CacheEntryRow {
        fingerprint: row_helpers::get(row, 0, T, "fingerprint")?,
        query: row_helpers::get(row, 1, T, "query")?,
        response: row_helpers::get(row, 2, T, "response")?,
        legal_area: row_helpers::get_opt(row, 3, T, "legal_area")?,
        hit_count: row_helpers::get(row, 4, T, "hit_count")?,
        last_used_at: row_helpers::parse_ts(&last_used_at, T, "last_used_at")?,
        expires_at: row_helpers::parse_ts(&expires_at, T, "expires_at")?,
        created_at: row_helpers::parse_ts(&created_at, T, "created_at")?,
    })
}
