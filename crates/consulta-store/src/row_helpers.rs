use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;

use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Parse a decimal TEXT column.
pub fn parse_decimal(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<Decimal, StoreError> {
    raw.parse().map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid decimal {raw}: {e}"),
    })
}

/// Parse an RFC 3339 TEXT column into UTC.
pub fn parse_ts(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow {
            table,
            column,
            detail: format!("invalid timestamp {raw}: {e}"),
        })
}

/// Canonical timestamp encoding. Fixed width so TEXT comparison in SQL is chronological.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn ts_is_lexically_ordered() {
        let a = Utc::now();
        let b = a + Duration::milliseconds(1);
        let c = a + Duration::days(400);
        assert!(ts(a) < ts(b));
        assert!(ts(b) < ts(c));
    }

    #[test]
    fn ts_roundtrip_keeps_micros() {
        let now = Utc::now();
        let parsed = parse_ts(&ts(now), "t", "c").unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn parse_decimal_failure() {
        let result = parse_decimal("two hours", "license_grants", "hours_remaining");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "license_grants", column: "hours_remaining", .. })
        ));
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<consulta_core::types::GrantStatus, _> =
            parse_enum("INVALID", "license_grants", "status");
        assert!(matches!(result, Err(StoreError::CorruptRow { column: "status", .. })));
    }

    #[test]
    fn parse_ts_failure() {
        assert!(parse_ts("yesterday", "cache_entries", "expires_at").is_err());
    }
}
