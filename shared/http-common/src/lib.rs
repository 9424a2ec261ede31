//! Shared HTTP utilities for the replacement sync workspace.
//!
//! Provides the JSON error body, the `since` query parsing used by
//! incremental sync, and timestamp formatting shared by the api-server and
//! the store adapters.

use chrono::{DateTime, Datelike, SecondsFormat, Utc};

// ============================================================================
// JSON Response Helpers (framework-agnostic)
// ============================================================================

/// Message returned when authentication fails.
pub const NOT_AUTHENTICATED: &str = "Not authenticated";
/// Message returned when a store error carries no message of its own.
pub const UNKNOWN_ERROR: &str = "Unknown error";
/// Message returned for unexpected handler failures.
pub const INTERNAL_SERVER_ERROR: &str = "Internal Server Error";
/// Message returned for unsupported methods.
pub const METHOD_NOT_ALLOWED: &str = "Method Not Allowed";

/// Create the error JSON clients expect.
///
/// Returns: `{"error": "<message>"}`
pub fn json_error(message: &str) -> serde_json::Value {
    serde_json::json!({ "error": message })
}

/// Error JSON for a store failure, falling back to [`UNKNOWN_ERROR`] when the
/// store gave no message.
pub fn json_store_error(message: &str) -> serde_json::Value {
    if message.trim().is_empty() {
        json_error(UNKNOWN_ERROR)
    } else {
        json_error(message)
    }
}

/// Headers that keep sync listings out of browser and proxy caches.
pub const NO_CACHE_HEADERS: [(&str, &str); 2] =
    [("cache-control", "no-store"), ("pragma", "no-cache")];

// ============================================================================
// Incremental Sync Helpers
// ============================================================================

/// Largest absolute millisecond offset a timestamp may carry (±100,000,000 days).
pub const MAX_EPOCH_MILLIS: f64 = 8.64e15;

/// Parse the `since` query parameter: milliseconds since the Unix epoch.
///
/// Parsing is lenient in the way a JavaScript `Number(...)` conversion is:
/// surrounding whitespace is ignored (whitespace alone means `0`), decimal,
/// exponent and `0x`/`0o`/`0b` forms are accepted, and fractional
/// milliseconds are truncated toward zero. Returns `None` when the value is
/// not a number or lies beyond ±[`MAX_EPOCH_MILLIS`].
///
/// Valid offsets past chrono's own range (about year ±262143) are clamped to
/// `DateTime::<Utc>::MAX_UTC` or `MIN_UTC`. No stored
/// row can sit beyond those, so the sync filter keeps its meaning.
pub fn parse_since(raw: &str) -> Option<DateTime<Utc>> {
    let millis = parse_js_number(raw)?;
    if !millis.is_finite() || millis.abs() > MAX_EPOCH_MILLIS {
        return None;
    }
    let millis = millis.trunc() as i64;
    match DateTime::from_timestamp_millis(millis) {
        Some(t) => Some(t),
        None if millis > 0 => Some(DateTime::<Utc>::MAX_UTC),
        None => Some(DateTime::<Utc>::MIN_UTC),
    }
}

fn parse_js_number(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return Some(0.0);
    }
    let lower = s.to_ascii_lowercase();
    for (prefix, radix) in [("0x", 16), ("0o", 8), ("0b", 2)] {
        if let Some(digits) = lower.strip_prefix(prefix) {
            // Overflow means far outside the valid range; report it as such.
            return match i64::from_str_radix(digits, radix) {
                Ok(v) => Some(v as f64),
                Err(_) if !digits.is_empty() && digits.chars().all(|c| c.is_digit(radix)) => {
                    Some(f64::INFINITY)
                }
                Err(_) => None,
            };
        }
    }
    // Rust also parses "inf"/"nan"; none of those spellings is a valid instant.
    let unsigned = lower.trim_start_matches(['+', '-']);
    if unsigned.starts_with("inf") || unsigned.starts_with("nan") {
        return None;
    }
    s.parse::<f64>().ok()
}

// ============================================================================
// Time Utilities
// ============================================================================

/// Render an instant as ISO-8601 with millisecond precision and a `Z` suffix,
/// e.g. `2024-01-01T00:00:00.000Z`.
///
/// Years outside `0000..=9999` use the expanded form `±YYYYYY`
/// (`+010000-01-01T00:00:00.000Z`), matching `Date.prototype.toISOString`.
pub fn to_iso_millis(t: DateTime<Utc>) -> String {
    let year = t.year();
    if (0..=9999).contains(&year) {
        return t.to_rfc3339_opts(SecondsFormat::Millis, true);
    }
    let sign = if year < 0 { '-' } else { '+' };
    format!(
        "{sign}{:06}-{}",
        year.unsigned_abs(),
        t.format("%m-%dT%H:%M:%S%.3fZ")
    )
}

/// Parse an RFC 3339 string into a UTC instant.
pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
