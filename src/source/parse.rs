//! Record parsing for newline-delimited JSON input.
//!
//! Each line is an object `{"tag": ..., "time": ..., "record": {...}}`.
//! `time` may be unix seconds (integer or float) or an RFC 3339 string and
//! defaults to the caller's clock. When `record` is absent, every other
//! top-level field is treated as the record.

use serde_json::Value as JsonValue;
use thiserror::Error;

use super::event::RawRecord;

/// Errors that can occur while parsing an input line.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line is not a json object")]
    NotAnObject,

    #[error("missing or empty tag")]
    MissingTag,

    #[error("invalid time: {raw}")]
    InvalidTime { raw: String },

    #[error("record is not a json object")]
    InvalidRecord,
}

/// Largest accepted event time magnitude in unix seconds
/// (9999-12-31T23:59:59Z).
pub const MAX_EVENT_TIME: i64 = 253_402_300_799;

/// Parse one input line into a [`RawRecord`]. `now` is used when the line
/// carries no time.
pub fn parse_line(line: &str, now: i64) -> Result<RawRecord, ParseError> {
    let parsed: JsonValue = serde_json::from_str(line)?;
    let JsonValue::Object(mut obj) = parsed else {
        return Err(ParseError::NotAnObject);
    };

    let tag = match obj.remove("tag") {
        Some(JsonValue::String(tag)) if !tag.is_empty() => tag,
        _ => return Err(ParseError::MissingTag),
    };

    let time = match obj.remove("time") {
        None | Some(JsonValue::Null) => now,
        Some(raw) => parse_time(&raw)?,
    };

    let record = match obj.remove("record") {
        Some(JsonValue::Object(record)) => record,
        Some(_) => return Err(ParseError::InvalidRecord),
        None => obj,
    };

    Ok(RawRecord { tag, time, record })
}

fn parse_time(raw: &JsonValue) -> Result<i64, ParseError> {
    let invalid = || ParseError::InvalidTime {
        raw: raw.to_string(),
    };

    let secs = match raw {
        JsonValue::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(secs), _) => secs,
            (None, Some(secs)) if secs.abs() <= MAX_EVENT_TIME as f64 => secs.floor() as i64,
            _ => return Err(invalid()),
        },
        JsonValue::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp())
            .map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };

    if !(-MAX_EVENT_TIME..=MAX_EVENT_TIME).contains(&secs) {
        return Err(invalid());
    }

    Ok(secs)
}

/// Build a record map from key/value pairs.
#[cfg(test)]
pub(crate) fn record_from_pairs<I, K>(pairs: I) -> serde_json::Map<String, JsonValue>
where
    I: IntoIterator<Item = (K, JsonValue)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
