//! Time utilities for roboclaw-deploy

use chrono::{SecondsFormat, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current time as an ISO-8601 string with millisecond precision
/// (`2026-03-01T12:00:00.000Z`).
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in a form usable inside file names
/// (`2026-03-01T12-00-00-000Z`).
pub fn file_timestamp() -> String {
    iso_timestamp().replace([':', '.'], "-")
}

/// Lowercase base-36 rendering of `value`
pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Default server name: `<prefix>-<base36 millis>`
pub fn generated_server_name(prefix: &str) -> String {
    format!("{}-{}", prefix, to_base36(current_time_millis()))
}
