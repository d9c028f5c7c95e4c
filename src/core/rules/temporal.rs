//! Date handling for temporal conditions
//!
//! Fields whose names contain `At`, `Date` or `Time` are compared as instants.
//! A rule value may be a relative expression such as `"24 hours ago"`, which
//! is resolved against the evaluation clock on every call (a rolling window),
//! or an absolute date.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Substrings that mark a field as holding a timestamp
const TEMPORAL_MARKERS: [&str; 3] = ["At", "Date", "Time"];

/// Naive layouts accepted for absolute dates, interpreted as UTC
const NAIVE_LAYOUTS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

fn relative_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*(\d+)\s+(minute|hour|day)s?\s+ago\s*$")
            .expect("relative time pattern is a valid regex")
    })
}

/// Check whether a field name is treated as a timestamp
///
/// The check is case-sensitive: `poolEnteredAt`, `dueDate` and `startTime`
/// are temporal, `status` and `category` are not.
pub fn is_temporal_field(field: &str) -> bool {
    TEMPORAL_MARKERS.iter().any(|marker| field.contains(marker))
}

/// Resolve a relative expression (`"<N> minute|hour|day(s) ago"`)
///
/// Returns `None` when the expression is not relative or the offset
/// overflows the representable range.
pub fn parse_relative(expr: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let caps = relative_pattern().captures(expr)?;
    let amount: i64 = caps[1].parse().ok()?;

    let offset = match caps[2].to_ascii_lowercase().as_str() {
        "minute" => TimeDelta::try_minutes(amount)?,
        "hour" => TimeDelta::try_hours(amount)?,
        "day" => TimeDelta::try_days(amount)?,
        _ => return None,
    };

    now.checked_sub_signed(offset)
}

/// Parse an absolute date string
///
/// Accepts RFC 3339, naive date-times (assumed UTC) and plain `YYYY-MM-DD`
/// dates (midnight UTC).
pub fn parse_absolute(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    for layout in NAIVE_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, layout) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Parse a rule-side time expression: relative first, then absolute
pub fn parse_time_expression(expr: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse_relative(expr, now).or_else(|| parse_absolute(expr))
}

/// Interpret an entity value as an instant
///
/// Strings go through [`parse_absolute`]; numbers are epoch milliseconds.
pub fn instant_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_absolute(s),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Interpret a rule value as a comparison threshold
pub fn threshold_from_value(value: &Value, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_time_expression(s, now),
        other => instant_from_value(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_temporal_field_heuristic() {
        assert!(is_temporal_field("poolEnteredAt"));
        assert!(is_temporal_field("dueDate"));
        assert!(is_temporal_field("startTime"));
        assert!(!is_temporal_field("status"));
        assert!(!is_temporal_field("created_at")); // case-sensitive
    }

    #[test]
    fn test_relative_hours() {
        let now = fixed_now();
        let parsed = parse_relative("24 hours ago", now).unwrap();
        assert_eq!(now - parsed, Duration::milliseconds(86_400_000));
    }

    #[test]
    fn test_relative_units_and_case() {
        let now = fixed_now();
        assert_eq!(
            parse_relative("1 Day ago", now).unwrap(),
            now - Duration::days(1)
        );
        assert_eq!(
            parse_relative("30 MINUTES AGO", now).unwrap(),
            now - Duration::minutes(30)
        );
        assert_eq!(
            parse_relative("  2 hour ago ", now).unwrap(),
            now - Duration::hours(2)
        );
    }

    #[test]
    fn test_relative_rejects_other_forms() {
        let now = fixed_now();
        assert!(parse_relative("24 hours", now).is_none());
        assert!(parse_relative("in 2 days", now).is_none());
        assert!(parse_relative("2 weeks ago", now).is_none());
        assert!(parse_relative("-1 hours ago", now).is_none());
    }

    #[test]
    fn test_relative_overflow_is_none() {
        assert!(parse_relative("999999999999999 days ago", fixed_now()).is_none());
    }

    #[test]
    fn test_absolute_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_absolute("2024-01-02T03:04:05Z"), Some(expected));
        assert_eq!(parse_absolute("2024-01-02T05:04:05+02:00"), Some(expected));
        assert_eq!(parse_absolute("2024-01-02 03:04:05"), Some(expected));
        assert_eq!(
            parse_absolute("2024-01-02"),
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap())
        );
        assert!(parse_absolute("not a date").is_none());
    }

    #[test]
    fn test_expression_prefers_relative() {
        let now = fixed_now();
        assert_eq!(
            parse_time_expression("3 days ago", now),
            Some(now - Duration::days(3))
        );
        assert_eq!(
            parse_time_expression("2024-06-01", now),
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_instant_from_epoch_millis() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let value = json!(expected.timestamp_millis());
        assert_eq!(instant_from_value(&value), Some(expected));
        assert!(instant_from_value(&json!(null)).is_none());
        assert!(instant_from_value(&json!(true)).is_none());
    }
}
