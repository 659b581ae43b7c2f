pub mod api;
pub mod capability;

use crate::errors::AppError;

/// Parse a snowflake id carried as a decimal string on the wire.
pub(crate) fn parse_snowflake(raw: &str, field: &'static str) -> Result<u64, AppError> {
    raw.parse::<u64>()
        .map_err(|_| AppError::BadRequest(format!("Invalid {field}: not a snowflake id")))
}
