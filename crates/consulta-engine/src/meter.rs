use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use consulta_core::clock::Clock;
use consulta_core::ids::{SessionId, UserId};
use consulta_core::types::SessionType;
use consulta_store::audit::{AuditAction, AuditRecord};

use crate::config::MeterConfig;
use crate::error::{LedgerError, MeterError, StartRejection};
use crate::ledger::LicenseLedger;

/// A running, billable session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub session_type: SessionType,
    pub started_at: DateTime<Utc>,
    /// Set while an `end` is in flight so a second close cannot bill twice.
    #[serde(default)]
    pub closing: bool,
}

/// Outcome of trying to take the close lock on a session.
#[derive(Clone, Debug, PartialEq)]
pub enum Claim {
    Claimed(ActiveSession),
    AlreadyClaimed,
    Absent,
}

/// Key-value store of active sessions, keyed by session id with a per-user index.
///
/// Implementations must make `insert_if_user_free` and `claim` atomic. Everything
/// else may be eventually consistent.
pub trait SessionRegistry: Send + Sync {
    fn get(&self, session_id: &SessionId) -> Option<ActiveSession>;
    fn find_by_user(&self, user_id: &UserId) -> Option<ActiveSession>;
    /// Register the session unless its user already has one. Returns whether it was inserted.
    fn insert_if_user_free(&self, session: ActiveSession) -> bool;
    fn claim(&self, session_id: &SessionId) -> Claim;
    fn release(&self, session_id: &SessionId);
    fn remove(&self, session_id: &SessionId) -> Option<ActiveSession>;
    fn scan(&self) -> Vec<ActiveSession>;
}

/// Single-process registry.
#[derive(Default)]
pub struct InMemoryRegistry {
    sessions: DashMap<SessionId, ActiveSession>,
    by_user: DashMap<UserId, SessionId>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRegistry for InMemoryRegistry {
    fn get(&self, session_id: &SessionId) -> Option<ActiveSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    fn find_by_user(&self, user_id: &UserId) -> Option<ActiveSession> {
        let session_id = self.by_user.get(user_id).map(|id| id.clone())?;
        self.get(&session_id)
    }

    fn insert_if_user_free(&self, session: ActiveSession) -> bool {
        match self.by_user.entry(session.user_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                // by_user shard stays locked until the session is visible
                self.sessions.insert(session.session_id.clone(), session.clone());
                slot.insert(session.session_id);
                true
            }
        }
    }

    fn claim(&self, session_id: &SessionId) -> Claim {
        match self.sessions.get_mut(session_id) {
            None => Claim::Absent,
            Some(s) if s.closing => Claim::AlreadyClaimed,
            Some(mut s) => {
                s.closing = true;
                Claim::Claimed(s.clone())
            }
        }
    }

    fn release(&self, session_id: &SessionId) {
        if let Some(mut s) = self.sessions.get_mut(session_id) {
            s.closing = false;
        }
    }

    fn remove(&self, session_id: &SessionId) -> Option<ActiveSession> {
        let (_, session) = self.sessions.remove(session_id)?;
        self.by_user
            .remove_if(&session.user_id, |_, id| id == session_id);
        Some(session)
    }

    fn scan(&self) -> Vec<ActiveSession> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }
}

/// What closing a session cost.
#[derive(Clone, Debug, PartialEq)]
pub struct EndReport {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub session_type: SessionType,
    pub duration: Duration,
    pub hours_consumed: Decimal,
    pub hours_remaining: Decimal,
}

/// A zombie session the sweep closed. `hours_consumed` is zero when it was
/// force-closed without billing.
#[derive(Clone, Debug, PartialEq)]
pub struct SweptSession {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub hours_consumed: Decimal,
    pub billed: bool,
    pub ended_at: DateTime<Utc>,
}

/// Wall-clock metering of active sessions, billed to the ledger on close.
#[derive(Clone)]
pub struct SessionMeter {
    registry: Arc<dyn SessionRegistry>,
    ledger: LicenseLedger,
    clock: Arc<dyn Clock>,
    config: MeterConfig,
}

impl SessionMeter {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        ledger: LicenseLedger,
        clock: Arc<dyn Clock>,
        config: MeterConfig,
    ) -> Self {
        Self {
            registry,
            ledger,
            clock,
            config,
        }
    }

    pub fn ledger(&self) -> &LicenseLedger {
        &self.ledger
    }

    /// Start metering. Refused without a grant covering the session's tier,
    /// or while the user already has a session running.
    #[instrument(skip(self), fields(user_id = %user_id, session_id = %session_id, session_type = %session_type))]
    pub fn start(
        &self,
        user_id: &UserId,
        session_type: SessionType,
        session_id: &SessionId,
    ) -> Result<ActiveSession, MeterError> {
        if !self
            .ledger
            .has_valid_access(user_id, Some(session_type.tier()))?
        {
            return Err(MeterError::Rejected(StartRejection::NoValidLicense));
        }

        let session = ActiveSession {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            session_type,
            started_at: self.clock.now(),
            closing: false,
        };
        if !self.registry.insert_if_user_free(session.clone()) {
            return Err(MeterError::Rejected(StartRejection::SessionAlreadyActive));
        }
        info!("session metering started");
        Ok(session)
    }

    /// Stop metering and debit the elapsed time.
    ///
    /// If the debit fails the session stays registered so the caller can retry
    /// or force-close it.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn end(&self, session_id: &SessionId) -> Result<EndReport, MeterError> {
        let session = match self.registry.claim(session_id) {
            Claim::Claimed(s) => s,
            Claim::AlreadyClaimed => return Err(MeterError::AlreadyClosing(session_id.to_string())),
            Claim::Absent => return Err(MeterError::NotFound(session_id.to_string())),
        };

        let now = self.clock.now();
        let duration = now - session.started_at;
        let hours = self.billable_hours(duration);

        let receipt = match self.ledger.debit(&session.user_id, hours) {
            Ok(r) => r,
            Err(e) => {
                self.registry.release(session_id);
                warn!(user_id = %session.user_id, hours = %hours, error = %e, "session debit failed, keeping session");
                return Err(e.into());
            }
        };

        self.registry.remove(session_id);
        let mut record = AuditRecord::new(&session.user_id, AuditAction::SessionBilled, now);
        record.session_id = Some(session.session_id.clone());
        record.session_type = Some(session.session_type);
        record.duration_secs = Some(duration.num_seconds());
        record.hours = Some(hours);
        self.ledger.append_audit(&record);

        info!(
            user_id = %session.user_id,
            hours = %hours,
            remaining = %receipt.grant.hours_remaining,
            "session billed"
        );
        Ok(EndReport {
            session_id: session.session_id,
            user_id: session.user_id,
            session_type: session.session_type,
            duration,
            hours_consumed: hours,
            hours_remaining: receipt.grant.hours_remaining,
        })
    }

    /// Elapsed time rounded to the nearest step, never below the minimum.
    pub fn billable_hours(&self, elapsed: Duration) -> Decimal {
        let raw = Decimal::from(elapsed.num_milliseconds()) / Decimal::from(3_600_000);
        let step = self.config.rounding_step_hours;
        let rounded = match raw.checked_div(step) {
            Some(steps) if step > Decimal::ZERO => {
                steps.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero) * step
            }
            _ => raw,
        };
        rounded.max(self.config.min_billable_hours)
    }

    /// End every session older than `max_age_hours` through the normal billing path.
    ///
    /// A zombie whose debit cannot succeed (balance or grant gone) is force-closed
    /// instead. Returns the sessions closed either way.
    #[instrument(skip(self))]
    pub fn sweep_zombies(&self, max_age_hours: i64) -> Vec<SweptSession> {
        let now = self.clock.now();
        let cutoff = now - Duration::hours(max_age_hours);
        let mut swept = Vec::new();
        for session in self.registry.scan() {
            if session.closing || session.started_at > cutoff {
                continue;
            }
            match self.end(&session.session_id) {
                Ok(report) => swept.push(SweptSession {
                    session_id: report.session_id,
                    user_id: report.user_id,
                    hours_consumed: report.hours_consumed,
                    billed: true,
                    ended_at: now,
                }),
                Err(MeterError::Ledger(
                    e @ (LedgerError::InsufficientHours { .. } | LedgerError::NoActiveGrant),
                )) => {
                    let reason = format!("zombie session could not be billed: {e}");
                    if let Ok(closed) = self.force_close(&session.session_id, &reason) {
                        swept.push(SweptSession {
                            session_id: closed.session_id,
                            user_id: closed.user_id,
                            hours_consumed: Decimal::ZERO,
                            billed: false,
                            ended_at: now,
                        });
                    }
                }
                Err(e) => {
                    warn!(session_id = %session.session_id, error = %e, "zombie sweep failed for session");
                }
            }
        }
        if !swept.is_empty() {
            info!(count = swept.len(), "zombie sessions swept");
        }
        swept
    }

    /// Sweep with the configured maximum age.
    pub fn sweep_zombies_default(&self) -> Vec<SweptSession> {
        self.sweep_zombies(self.config.zombie_max_age_hours)
    }

    /// Drop a session without billing it. Audited.
    ///
    /// Refused while an `end` holds the session, so a session is never both
    /// billed and force-closed.
    #[instrument(skip(self, reason), fields(session_id = %session_id))]
    pub fn force_close(&self, session_id: &SessionId, reason: &str) -> Result<ActiveSession, MeterError> {
        match self.registry.claim(session_id) {
            Claim::Claimed(_) => {}
            Claim::AlreadyClaimed => return Err(MeterError::AlreadyClosing(session_id.to_string())),
            Claim::Absent => return Err(MeterError::NotFound(session_id.to_string())),
        }
        let session = self
            .registry
            .remove(session_id)
            .ok_or_else(|| MeterError::NotFound(session_id.to_string()))?;

        let now = self.clock.now();
        let mut record = AuditRecord::new(&session.user_id, AuditAction::SessionForceClosed, now);
        record.session_id = Some(session.session_id.clone());
        record.session_type = Some(session.session_type);
        record.duration_secs = Some((now - session.started_at).num_seconds());
        record.detail = Some(reason.to_string());
        self.ledger.append_audit(&record);

        warn!(user_id = %session.user_id, reason, "session force-closed without billing");
        Ok(session)
    }

    pub fn active_for_user(&self, user_id: &UserId) -> Option<ActiveSession> {
        self.registry.find_by_user(user_id)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<ActiveSession> {
        self.registry.get(session_id)
    }

    pub fn list_active(&self) -> Vec<ActiveSession> {
        let mut sessions = self.registry.scan();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }
}
