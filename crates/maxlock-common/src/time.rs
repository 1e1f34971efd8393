use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// The zero instant an invalidated lock expiration is pinned to.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// `start + duration - margin`, or `None` when any step leaves the range
/// chrono can represent.
pub fn checked_deadline(
    start: DateTime<Utc>,
    duration: Duration,
    margin: Duration,
) -> Option<DateTime<Utc>> {
    let duration = TimeDelta::from_std(duration).ok()?;
    let margin = TimeDelta::from_std(margin).ok()?;
    start.checked_add_signed(duration)?.checked_sub_signed(margin)
}

pub fn whole_millis(duration: Duration) -> Option<u64> {
    if duration.subsec_nanos() % 1_000_000 != 0 {
        return None;
    }
    u64::try_from(duration.as_millis()).ok()
}
