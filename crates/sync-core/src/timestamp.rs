//! Timestamp normalization.
//!
//! Timestamps reach the engine either as native driver values or as text in
//! one of the encodings older versions of the application wrote:
//!
//! - `2026-01-16 00:38:03.9558929+00:00` (space separator, fraction, offset)
//! - `2026-01-16T00:38:03.955Z` (RFC 3339)
//! - `2026-01-16 00:38:03` (no offset, interpreted in the configured zone)
//!
//! All of them are re-emitted as RFC 3339 in UTC with a `Z` suffix, since
//! the column on the other side may be plain text.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::debug;

use crate::values::SqlValue;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("unrecognized timestamp encoding: {0}")]
pub struct ParseError(pub String);

/// Formats tried, in order, for values carrying an explicit offset.
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];

/// Formats tried for values without an offset.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Render a timestamp in the canonical wire format.
pub fn canonical(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Parse a textual timestamp using the fallback chain.
pub fn parse(s: &str, naive_zone: Tz) -> Result<DateTime<Utc>, ParseError> {
    let s = s.trim();

    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return naive_zone
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| ParseError(s.to_string()));
        }
    }

    Err(ParseError(s.to_string()))
}

/// Cheap shape check: `YYYY-MM-DD` followed by a time separator.
pub fn looks_like_timestamp(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 19
        && b[..4].iter().all(u8::is_ascii_digit)
        && b[4] == b'-'
        && b[5..7].iter().all(u8::is_ascii_digit)
        && b[7] == b'-'
        && b[8..10].iter().all(u8::is_ascii_digit)
        && (b[10] == b' ' || b[10] == b'T')
}

/// Normalize a value before it crosses to the other store.
///
/// Native timestamps and timestamp-shaped text become canonical text. Text
/// that looks like a timestamp but fails every format passes through
/// unchanged.
pub fn normalize(value: SqlValue, naive_zone: Tz) -> SqlValue {
    match value {
        SqlValue::Timestamp(dt) => SqlValue::Text(canonical(&dt)),
        SqlValue::Text(s) if looks_like_timestamp(&s) => match parse(&s, naive_zone) {
            Ok(dt) => SqlValue::Text(canonical(&dt)),
            Err(e) => {
                debug!("Passing timestamp through unchanged: {e}");
                SqlValue::Text(s)
            }
        },
        other => other,
    }
}
