//! Human-readable duration formatting
//!
//! Used for ETA and phase timing output in logs and the CLI.

use std::time::Duration;

const SHORT_FORMAT_MAX_SECS: u64 = 100;
const MEDIUM_FORMAT_MAX_SECS: u64 = 6000;

/// Format a duration by magnitude
///
/// - under 100 s: `X.XXs`
/// - under 100 min: `M:SS`
/// - otherwise: `H:MM:SS`
///
/// ```
/// use std::time::Duration;
/// use setlist_common::human_time::format_duration;
///
/// assert_eq!(format_duration(Duration::from_millis(1250)), "1.25s");
/// assert_eq!(format_duration(Duration::from_secs(330)), "5:30");
/// assert_eq!(format_duration(Duration::from_secs(3661)), "61:01");
/// assert_eq!(format_duration(Duration::from_secs(6000)), "1:40:00");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < SHORT_FORMAT_MAX_SECS {
        format!("{:.2}s", duration.as_secs_f64())
    } else if secs < MEDIUM_FORMAT_MAX_SECS {
        format!("{}:{:02}", secs / 60, secs % 60)
    } else {
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Format milliseconds, `"-"` when absent
pub fn format_millis_opt(millis: Option<u64>) -> String {
    millis
        .map(|ms| format_duration(Duration::from_millis(ms)))
        .unwrap_or_else(|| "-".to_string())
}
