//! Timestamps are stored as RFC-3339 text.

use chrono::{DateTime, Utc};

pub(crate) fn to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn from_sql(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn from_sql_opt(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| from_sql(idx, &v)).transpose()
}

/// Error for a text column holding an unknown enum value.
pub(crate) fn bad_enum(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unexpected value `{value}`").into(),
    )
}
