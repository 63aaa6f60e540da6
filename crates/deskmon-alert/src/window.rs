//! Checked time arithmetic for rule windows, silence periods, escalation
//! delays and retention cutoffs.

use chrono::{DateTime, Duration, Utc};

/// Longest accepted rule window, silence period, escalation delay or
/// retention interval: 100 years.
pub const MAX_SPAN_SECS: u64 = 100 * 365 * 86_400;

/// Longest accepted retention period.
pub const MAX_RETENTION_DAYS: u32 = 100 * 365;

/// `now - secs`, or `None` when that instant is not representable.
pub fn seconds_before(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let span = Duration::try_seconds(i64::try_from(secs).ok()?)?;
    now.checked_sub_signed(span)
}

/// `now - days`, or `None` when that instant is not representable.
pub fn days_before(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(Duration::try_days(i64::from(days))?)
}

/// True once at least `secs` have passed between `since` and `now`. A span
/// reaching past the representable range has never elapsed.
pub fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>, secs: u64) -> bool {
    seconds_before(now, secs).is_some_and(|cutoff| since <= cutoff)
}
