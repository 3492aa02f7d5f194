//! Timestamp utilities

use chrono::{DateTime, SubsecRound, Utc};

/// Upper bound used when converting very large std durations (100 years).
const MAX_CHRONO_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current UTC timestamp truncated to whole milliseconds
///
/// Persisted timestamps are stored as unix milliseconds; truncating up front
/// makes an in-memory value compare equal to its stored copy.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Unix milliseconds to UTC timestamp
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Convert a std duration into a chrono duration, saturating at 100 years
pub fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    let secs = duration.as_secs().min(MAX_CHRONO_SECS) as i64;
    chrono::Duration::seconds(secs) + chrono::Duration::nanoseconds(duration.subsec_nanos() as i64)
}
