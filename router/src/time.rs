//! Millisecond wall clock.
//!
//! Every timestamp the router handles is milliseconds since the Unix epoch.
//! Core logic never reads the clock itself; callers pass `now` in, which is
//! what lets the tests replay clock jumps.

use std::time::Duration;

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

/// Current wall-clock time in milliseconds. Clamps pre-epoch clocks to zero.
pub fn now_ms() -> Millis {
    chrono::Utc::now().timestamp_millis().max(0) as Millis
}

/// Renders a millisecond span for log output ("3m12s", "850ms").
pub fn human_duration(ms: Millis) -> String {
    let d = Duration::from_millis(ms);
    if d.as_secs() == 0 {
        return format!("{}ms", d.as_millis());
    }
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    match (h, m) {
        (0, 0) => format!("{s}s"),
        (0, _) => format!("{m}m{s}s"),
        _ => format!("{h}h{m}m{s}s"),
    }
}
