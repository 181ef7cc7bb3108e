//! Parsing of Caddy-style JSON access-log lines.
//!
//! A line looks like
//!
//! ```json
//! {"ts":1714564800.123,"logger":"http.log.access.gpu","status":200,
//!  "upstream":{"name":"gpu"},"request":{"uri":"/v1/chat"}}
//! ```
//!
//! The upstream label is taken from `upstream.name`, a plain string
//! `upstream`, or the suffix of a named access logger
//! (`http.log.access.<label>`), in that order.

use chrono::{DateTime, Utc};
use serde_json::Value;
use shelver_state::ActivityObservation;
use thiserror::Error;

const ACCESS_LOGGER_PREFIX: &str = "http.log.access.";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing or invalid field `{0}`")]
    Field(&'static str),
}

/// Parse one access-log line into an observation.
pub fn parse_line(line: &str) -> Result<ActivityObservation, ParseError> {
    let payload: Value = serde_json::from_str(line.trim())?;

    let timestamp = payload
        .get("ts")
        .and_then(parse_timestamp)
        .ok_or(ParseError::Field("ts"))?;

    let status_code = payload
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .ok_or(ParseError::Field("status"))?;

    let upstream_label = upstream_label(&payload).ok_or(ParseError::Field("upstream"))?;

    Ok(ActivityObservation {
        timestamp,
        upstream_label,
        status_code,
    })
}

fn parse_timestamp(ts: &Value) -> Option<DateTime<Utc>> {
    match ts {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() || secs < 0.0 {
                return None;
            }
            let whole = secs.trunc() as i64;
            let nanos = ((secs - secs.trunc()) * 1e9).round() as u32;
            DateTime::from_timestamp(whole, nanos.min(999_999_999))
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        _ => None,
    }
}

fn upstream_label(payload: &Value) -> Option<String> {
    match payload.get("upstream") {
        Some(Value::Object(upstream)) => {
            if let Some(name) = upstream.get("name").and_then(Value::as_str)
                && !name.is_empty()
            {
                return Some(name.to_string());
            }
        }
        Some(Value::String(name)) if !name.is_empty() => return Some(name.clone()),
        _ => {}
    }

    payload
        .get("logger")
        .and_then(Value::as_str)
        .and_then(|logger| logger.strip_prefix(ACCESS_LOGGER_PREFIX))
        .filter(|label| !label.is_empty())
        .map(str::to_string)
}
