//! Conversion of raw scraped/imported strings into typed field values

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::models::{FieldValue, ValueType};

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse a timestamp; naive values are taken as UTC.
///
/// With an explicit `format` only that format is tried. Otherwise RFC 3339,
/// common ISO-like layouts, plain dates and Unix seconds are accepted.
pub fn parse_timestamp(raw: &str, format: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(format) = format {
        if let Ok(dt) = DateTime::parse_from_str(raw, format) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
        return NaiveDate::parse_from_str(raw, format)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for candidate in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, candidate) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

/// Extract the first number from free text ("12.345 abitanti", "21 °C").
///
/// `thousands_separator` is removed before scanning.
pub fn parse_number(raw: &str, thousands_separator: Option<&str>) -> Option<f64> {
    let cleaned = match thousands_separator {
        Some(sep) if !sep.is_empty() => raw.replace(sep, ""),
        _ => raw.to_string(),
    };

    let chars: Vec<char> = cleaned.chars().collect();
    let start = chars.iter().enumerate().position(|(i, c)| {
        c.is_ascii_digit()
            || (*c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()))
    })?;

    let mut end = start + 1;
    let mut seen_dot = false;
    while let Some(c) = chars.get(end) {
        if c.is_ascii_digit() {
            end += 1;
        } else if *c == '.' && !seen_dot && chars.get(end + 1).is_some_and(|n| n.is_ascii_digit()) {
            seen_dot = true;
            end += 1;
        } else {
            break;
        }
    }

    chars[start..end].iter().collect::<String>().parse().ok()
}

/// Convert raw text according to the configured value type
pub fn convert(
    raw: &str,
    value_type: ValueType,
    time_format: Option<&str>,
    thousands_separator: Option<&str>,
) -> Option<FieldValue> {
    match value_type {
        ValueType::Number => parse_number(raw, thousands_separator).map(FieldValue::Number),
        ValueType::Text => {
            let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
            (!text.is_empty()).then_some(FieldValue::Text(text))
        }
        ValueType::Timestamp => parse_timestamp(raw, time_format).map(FieldValue::Timestamp),
    }
}
