use crate::errors::ServerError;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in whole seconds since the UNIX epoch.
///
/// Message expiry is tracked at second granularity.
pub fn wall_secs() -> Result<u64, ServerError> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
///
/// Snapshot deadlines are tracked at millisecond granularity.
pub fn wall_millis() -> Result<u64, ServerError> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}
