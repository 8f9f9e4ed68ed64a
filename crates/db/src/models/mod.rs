//! Row types read from Postgres and their conversion into domain types.

pub mod focus_match;
pub mod participant;
pub mod session;

use crate::store::StoreError;

/// Parse a status column, reporting the table and value on failure.
pub(crate) fn parse_column<T>(
    table: &'static str,
    value: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, StoreError> {
    parse(value).ok_or_else(|| StoreError::Corrupt(format!("{table}: unexpected value '{value}'")))
}

/// Convert a non-negative INTEGER column into minutes.
pub(crate) fn minutes_column(table: &'static str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{table}: negative duration {value}")))
}
