//! Display helpers for timestamps and durations

use chrono::{DateTime, Local, Utc};

/// Local date/time, for example `01/15/2025 14:30 -08:00`
pub fn format_datetime_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%m/%d/%Y %H:%M %:z")
        .to_string()
}

/// Time until `at` as `2h 5m`, or `None` once it has passed
pub fn format_remaining(at: DateTime<Utc>, now: DateTime<Utc>) -> Option<String> {
    let remaining = at.signed_duration_since(now);
    if remaining <= chrono::Duration::zero() {
        return None;
    }

    let hours = remaining.num_hours();
    let mins = remaining.num_minutes() % 60;
    if hours > 0 {
        Some(format!("{}h {}m", hours, mins))
    } else {
        Some(format!("{}m", remaining.num_minutes().max(1)))
    }
}
