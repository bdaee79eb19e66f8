//! Structured-output recovery for service responses.
//!
//! Responses are expected to carry one JSON object or array, sometimes
//! wrapped in explanatory prose. [`parse_json_like`] is a deliberately
//! small heuristic for that case, not a JSON grammar: it does not balance
//! brackets, skip string literals, or pick among several embedded values.

use crate::error::Result;
use crate::PipelineError;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Recover a JSON value from response text.
///
/// 1. Strict parse of the trimmed text.
/// 2. Slice from the first `{` or `[` to the last matching `}` or `]`
///    and parse that.
/// 3. Otherwise a [`PipelineError::Parse`] carrying the full raw text.
///
/// # Example
///
/// ```
/// use llm_docflow::parsing::parse_json_like;
///
/// let v = parse_json_like("Here you go:\n{\"doc_type\": \"PO\"}\nLet me know!").unwrap();
/// assert_eq!(v["doc_type"], "PO");
/// ```
pub fn parse_json_like(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    let strict_err = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let Some(start) = trimmed.find(['{', '[']) else {
        return Err(parse_error(format!("no JSON object or array found ({strict_err})"), text));
    };
    let close = if trimmed.as_bytes()[start] == b'{' { '}' } else { ']' };
    let Some(end) = trimmed.rfind(close) else {
        return Err(parse_error(format!("unterminated JSON, missing '{close}'"), text));
    };
    if end < start {
        return Err(parse_error("closing bracket precedes opening bracket".into(), text));
    }

    serde_json::from_str::<Value>(&trimmed[start..=end])
        .map_err(|e| parse_error(format!("embedded JSON is invalid: {e}"), text))
}

/// [`parse_json_like`] followed by deserialization into `T`.
pub fn parse_json_like_as<T: DeserializeOwned>(text: &str) -> Result<T> {
    let value = parse_json_like(text)?;
    serde_json::from_value(value).map_err(|e| parse_error(format!("unexpected shape: {e}"), text))
}

fn parse_error(message: String, raw: &str) -> PipelineError {
    PipelineError::Parse {
        message,
        raw: raw.to_string(),
    }
}
