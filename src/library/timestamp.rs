//! Lenient timestamp parsing.
//!
//! Calibre and FanFicFare both emit dates in whatever shape the source
//! happened to use. Everything is normalized to whole-second UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer};

/// Layouts that carry their own offset.
const ZONED_LAYOUTS: &[&str] = &[
    // Ruby date
    "%a %b %d %H:%M:%S %z %Y",
];

/// Layouts with a time of day but no offset; interpreted as UTC.
const NAIVE_DATETIME_LAYOUTS: &[&str] = &[
    // ANSI C, and Unix date once the zone name is dropped
    "%a %b %e %H:%M:%S %Y",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Date-only layouts; interpreted as midnight UTC.
const DATE_LAYOUTS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%a %b %e %Y", "%b %e %Y", "%m/%d/%Y"];

/// Round to the nearest second.
pub fn normalize(time: DateTime<Utc>) -> DateTime<Utc> {
    time.round_subsecs(0)
}

/// Parse a timestamp in any of the known layouts.
pub fn parse(input: &str) -> Option<DateTime<Utc>> {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let input = collapsed.as_str();

    if let Ok(time) = DateTime::parse_from_rfc3339(input) {
        return Some(normalize(time.with_timezone(&Utc)));
    }
    if let Ok(time) = DateTime::parse_from_rfc2822(input) {
        return Some(normalize(time.with_timezone(&Utc)));
    }

    for layout in ZONED_LAYOUTS {
        if let Ok(time) = DateTime::parse_from_str(input, layout) {
            return Some(normalize(time.with_timezone(&Utc)));
        }
    }

    let without_zone = strip_zone_name(input);
    for candidate in [input, without_zone.as_str()] {
        for layout in NAIVE_DATETIME_LAYOUTS {
            if let Ok(time) = NaiveDateTime::parse_from_str(candidate, layout) {
                return Some(normalize(time.and_utc()));
            }
        }
    }

    for layout in DATE_LAYOUTS {
        if let Ok(date) = NaiveDate::parse_from_str(input, layout) {
            return date.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        }
    }

    None
}

/// Drop a zone abbreviation such as `MST` from a Unix `date` string.
fn strip_zone_name(input: &str) -> String {
    let parts: Vec<&str> = input.split(' ').collect();
    if parts.len() == 6 && parts[4].chars().all(|c| c.is_ascii_uppercase()) {
        let mut kept = parts;
        kept.remove(4);
        kept.join(" ")
    } else {
        input.to_string()
    }
}

/// Deserialize an optional lenient timestamp; `null` and `""` are absent.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => parse(text).map(Some).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "{}: failed to parse as any of the known formats",
                text
            ))
        }),
    }
}
