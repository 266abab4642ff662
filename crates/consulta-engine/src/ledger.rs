use std::sync::Arc;

use chrono::Duration;
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use consulta_core::clock::Clock;
use consulta_core::ids::{TemplateId, UserId};
use consulta_core::types::{GrantSource, LicenseKind, Tier};
use consulta_store::audit::{AuditAction, AuditRecord, AuditRepo};
use consulta_store::grants::{DebitOutcome, GrantRepo, GrantRow, IssueOutcome, NewGrant};
use consulta_store::templates::{TemplateRepo, TemplateRow, Validity};
use consulta_store::usage::{UsageRepo, UsageRow};
use consulta_store::{Database, StoreError};

use crate::error::LedgerError;

/// Result of a successful debit.
#[derive(Clone, Debug, PartialEq)]
pub struct DebitReceipt {
    pub grant: GrantRow,
    pub usage: UsageRow,
}

/// Hour balances across a user's license grants.
#[derive(Clone)]
pub struct LicenseLedger {
    grants: Arc<GrantRepo>,
    templates: Arc<TemplateRepo>,
    usage: Arc<UsageRepo>,
    audit: Arc<AuditRepo>,
    clock: Arc<dyn Clock>,
}

impl LicenseLedger {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            grants: Arc::new(GrantRepo::new(db.clone())),
            templates: Arc::new(TemplateRepo::new(db.clone())),
            usage: Arc::new(UsageRepo::new(db.clone())),
            audit: Arc::new(AuditRepo::new(db)),
            clock,
        }
    }

    /// Expire the user's stale grants, then return the most recent usable one.
    pub fn resolve_active_grant(&self, user_id: &UserId) -> Result<Option<GrantRow>, LedgerError> {
        Ok(self.grants.resolve_active(user_id, self.clock.now())?)
    }

    /// Whether the user holds a usable grant covering `tier` (any tier if `None`).
    pub fn has_valid_access(
        &self,
        user_id: &UserId,
        tier: Option<Tier>,
    ) -> Result<bool, LedgerError> {
        let Some(grant) = self.resolve_active_grant(user_id)? else {
            return Ok(false);
        };
        Ok(match tier {
            Some(requested) => grant.tier.covers(requested),
            None => true,
        })
    }

    /// Take `hours` off the active grant. The balance never goes negative.
    #[instrument(skip(self), fields(user_id = %user_id, hours = %hours))]
    pub fn debit(&self, user_id: &UserId, hours: Decimal) -> Result<DebitReceipt, LedgerError> {
        match self.grants.debit(user_id, hours, self.clock.now())? {
            DebitOutcome::Debited { grant, usage } => {
                info!(
                    grant_id = %grant.id,
                    remaining = %grant.hours_remaining,
                    "hours debited"
                );
                Ok(DebitReceipt { grant, usage })
            }
            DebitOutcome::Insufficient { remaining } => {
                warn!(remaining = %remaining, "debit refused, insufficient hours");
                Err(LedgerError::InsufficientHours {
                    requested: hours,
                    remaining,
                })
            }
            DebitOutcome::NoGrant => Err(LedgerError::NoActiveGrant),
        }
    }

    /// Issue a grant from a template. Refused while the user holds an active grant.
    #[instrument(skip(self), fields(user_id = %user_id, template_id = %template_id, source = %source))]
    pub fn issue_grant(
        &self,
        user_id: &UserId,
        template_id: &TemplateId,
        source: GrantSource,
    ) -> Result<GrantRow, LedgerError> {
        let template = self.template(template_id)?;
        self.issue_from(user_id, &template, source, source == GrantSource::Trial)
    }

    /// Issue the trial plan. A user gets it at most once, ever.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn issue_trial(&self, user_id: &UserId) -> Result<GrantRow, LedgerError> {
        let template = self
            .templates
            .find_by_kind(LicenseKind::Trial)?
            .ok_or_else(|| LedgerError::TemplateNotFound("trial".into()))?;
        self.issue_from(user_id, &template, GrantSource::Trial, true)
    }

    fn template(&self, template_id: &TemplateId) -> Result<TemplateRow, LedgerError> {
        match self.templates.get(template_id) {
            Ok(t) => Ok(t),
            Err(StoreError::NotFound(_)) => Err(LedgerError::TemplateNotFound(template_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn issue_from(
        &self,
        user_id: &UserId,
        template: &TemplateRow,
        source: GrantSource,
        once_per_source: bool,
    ) -> Result<GrantRow, LedgerError> {
        let now = self.clock.now();
        let expires_at = match template.validity {
            Validity::Days(days) => Some(now + Duration::days(i64::from(days))),
            Validity::Unlimited => None,
        };
        let new = NewGrant {
            user_id: user_id.clone(),
            template_id: template.id.clone(),
            hours: template.hours_total,
            source,
            expires_at,
        };

        match self.grants.issue(new, once_per_source, now)? {
            IssueOutcome::Issued(grant) => {
                info!(grant_id = %grant.id, hours = %grant.hours_remaining, "grant issued");
                let mut record = AuditRecord::new(user_id, AuditAction::GrantIssued, now);
                record.hours = Some(grant.hours_remaining);
                record.detail = Some(format!("{} ({source})", template.name));
                self.append_audit(&record);
                Ok(grant)
            }
            IssueOutcome::ActiveExists(active) => {
                info!(active_grant = %active.id, "grant refused, user already has one");
                Err(LedgerError::AlreadyHasActiveGrant)
            }
            IssueOutcome::TrialClaimed => Err(LedgerError::TrialAlreadyClaimed),
        }
    }

    /// Every grant the user has held, newest first.
    pub fn list_grants(&self, user_id: &UserId) -> Result<Vec<GrantRow>, LedgerError> {
        Ok(self.grants.list_for_user(user_id)?)
    }

    /// Administrative top-up of the active grant.
    #[instrument(skip(self), fields(user_id = %user_id, hours = %hours))]
    pub fn credit(&self, user_id: &UserId, hours: Decimal) -> Result<GrantRow, LedgerError> {
        let now = self.clock.now();
        let grant = self
            .grants
            .credit(user_id, hours, now)?
            .ok_or(LedgerError::NoActiveGrant)?;

        let mut record = AuditRecord::new(user_id, AuditAction::GrantCredited, now);
        record.hours = Some(hours);
        self.append_audit(&record);
        Ok(grant)
    }

    /// Flip every stale active grant to expired. Returns how many changed.
    pub fn expire_stale(&self) -> Result<usize, LedgerError> {
        Ok(self.grants.expire_stale(self.clock.now())?)
    }

    pub fn usage(&self, user_id: &UserId) -> Result<UsageRow, LedgerError> {
        Ok(self.usage.get(user_id)?)
    }

    pub(crate) fn append_audit(&self, record: &AuditRecord) {
        if let Err(e) = self.audit.append(record) {
            warn!(user_id = %record.user_id, action = %record.action, error = %e, "audit append failed");
        }
    }
}
