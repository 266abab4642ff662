use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use consulta_core::ids::TemplateId;
use consulta_core::types::{LicenseKind, Tier};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::schema::UNLIMITED_VALIDITY_DAYS;

/// How long a grant issued from a template stays usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Days(u32),
    Unlimited,
}

impl Validity {
    fn to_column(self) -> i64 {
        match self {
            Self::Days(d) => i64::from(d),
            Self::Unlimited => UNLIMITED_VALIDITY_DAYS,
        }
    }

    fn from_column(days: i64) -> Self {
        if days >= UNLIMITED_VALIDITY_DAYS {
            Self::Unlimited
        } else {
            Self::Days(days.max(0) as u32)
        }
    }
}

/// Plan definition. Read-only to the ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemplateRow {
    pub id: TemplateId,
    pub name: String,
    pub kind: LicenseKind,
    pub hours_total: Decimal,
    pub validity: Validity,
    pub tier: Tier,
    pub price_cents: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewTemplate {
    pub name: String,
    pub kind: LicenseKind,
    pub hours_total: Decimal,
    pub validity: Validity,
    pub tier: Tier,
    pub price_cents: i64,
}

/// The plans every fresh installation starts with.
pub fn default_catalogue() -> Vec<NewTemplate> {
    vec![
        NewTemplate {
            name: "Prueba gratuita".into(),
            kind: LicenseKind::Trial,
            hours_total: Decimal::new(2, 0),
            validity: Validity::Days(7),
            tier: Tier::Ai,
            price_cents: 0,
        },
        NewTemplate {
            name: "Estándar".into(),
            kind: LicenseKind::Standard,
            hours_total: Decimal::new(10, 0),
            validity: Validity::Days(90),
            tier: Tier::Both,
            price_cents: 4_900,
        },
        NewTemplate {
            name: "Premium".into(),
            kind: LicenseKind::Premium,
            hours_total: Decimal::new(40, 0),
            validity: Validity::Unlimited,
            tier: Tier::Both,
            price_cents: 14_900,
        },
    ]
}

const SELECT_COLUMNS: &str =
    "SELECT id, name, kind, hours_total, validity_days, tier, price_cents, created_at FROM license_templates";

pub struct TemplateRepo {
    db: Database,
}

impl TemplateRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a template. Names are unique.
    #[instrument(skip(self, template), fields(name = %template.name))]
    pub fn create(&self, template: NewTemplate, now: DateTime<Utc>) -> Result<TemplateRow, StoreError> {
        let id = TemplateId::new();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO license_templates (id, name, kind, hours_total, validity_days, tier, price_cents, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id.as_str(),
                    template.name,
                    template.kind.to_string(),
                    template.hours_total.to_string(),
                    template.validity.to_column(),
                    template.tier.to_string(),
                    template.price_cents,
                    row_helpers::ts(now),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Conflict(format!("template {} already exists", template.name))
                }
                other => other.into(),
            })?;

            Ok(TemplateRow {
                id,
                name: template.name,
                kind: template.kind,
                hours_total: template.hours_total,
                validity: template.validity,
                tier: template.tier,
                price_cents: template.price_cents,
                created_at: now,
            })
        })
    }

    #[instrument(skip(self), fields(template_id = %id))]
    pub fn get(&self, id: &TemplateId) -> Result<TemplateRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_template(row),
                None => Err(StoreError::NotFound(format!("template {id}"))),
            }
        })
    }

    /// Oldest template of the given kind, if any.
    #[instrument(skip(self), fields(kind = %kind))]
    pub fn find_by_kind(&self, kind: LicenseKind) -> Result<Option<TemplateRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE kind = ?1 ORDER BY created_at ASC, rowid ASC LIMIT 1"
            ))?;
            let mut rows = stmt.query([kind.to_string()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_template(row)?)),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<TemplateRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY price_cents ASC, name ASC"))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_template(row)?);
            }
            Ok(results)
        })
    }

    /// Insert the default catalogue, skipping plans whose name already exists.
    /// Returns how many templates were created.
    pub fn seed_defaults(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut created = 0;
        for template in default_catalogue() {
            match self.create(template, now) {
                Ok(_) => created += 1,
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if created > 0 {
            info!(created, "seeded license templates");
        }
        Ok(created)
    }
}

fn row_to_template(row: &rusqlite::Row<'_>) -> Result<TemplateRow, StoreError> {
    const T: &str = "license_templates";
    let kind: String = row_helpers::get(row, 2, T, "kind")?;
    let hours: String = row_helpers::get(row, 3, T, "hours_total")?;
    let tier: String = row_helpers::get(row, 5, T, "tier")?;
    let created_at: String = row_helpers::get(row, 7, T, "created_at")?;

    Ok(TemplateRow {
        id: TemplateId::from_raw(row_helpers::get::<String>(row, 0, T, "id")?),
        name: row_helpers::get(row, 1, T, "name")?,
        kind: row_helpers::parse_enum(&kind, T, "kind")?,
        hours_total: row_helpers::parse_decimal(&hours, T, "hours_total")?,
        validity: Validity::from_column(row_helpers::get(row, 4, T, "validity_days")?),
        tier: row_helpers::parse_enum(&tier, T, "tier")?,
        price_cents: row_helpers::get(row, 6, T, "price_cents")?,
        created_at: row_helpers::parse_ts(&created_at, T, "created_at")?,
    })
}
