//! Retry delay schedule for failed queue entries.
//!
//! `delay = min(2^attempt_count minutes, cap)`, where `attempt_count` is the
//! count *after* the failure was recorded. With the default 120 minute cap:
//!
//! ```text
//! attempt   1    2    3    4     5     6     7+
//! delay     2m   4m   8m   16m   32m   64m   120m
//! ```

use chrono::{DateTime, Duration, Utc};

/// Default ceiling for a single retry delay.
pub const DEFAULT_BACKOFF_CAP_MINUTES: i64 = 120;

/// Delay before the next automatic retry.
pub fn retry_delay(attempt_count: u32, cap: Duration) -> Duration {
    // 2^31 minutes is far past any sane cap; clamp before shifting.
    let exponent = attempt_count.min(31);
    let minutes = 1i64 << exponent;
    let delay = Duration::minutes(minutes);
    if delay > cap {
        cap
    } else {
        delay
    }
}

/// Absolute time of the next automatic retry.
pub fn next_retry_at(now: DateTime<Utc>, attempt_count: u32, cap: Duration) -> DateTime<Utc> {
    now + retry_delay(attempt_count, cap)
}
