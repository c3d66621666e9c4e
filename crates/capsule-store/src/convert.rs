//! Column conversions shared by the row mappers.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct InvalidValue(String);

/// Timestamps are stored as fixed-width RFC 3339 UTC text so that SQL string
/// comparison matches chronological order.
pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn ts_from_sql(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn uuid_from_sql(idx: usize, s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn array_from_sql<const N: usize>(idx: usize, bytes: &[u8]) -> rusqlite::Result<[u8; N]> {
    <[u8; N]>::try_from(bytes).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Blob,
            Box::new(InvalidValue(format!(
                "expected {N} bytes, got {}",
                bytes.len()
            ))),
        )
    })
}

pub(crate) fn invalid_text(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(InvalidValue(msg)))
}
