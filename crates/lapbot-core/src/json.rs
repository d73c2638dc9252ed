//! Decoding JSON out of model responses.

use serde_json::Value;

use crate::error::AppError;

/// Removes a surrounding Markdown code fence (```` ```json ... ``` ````).
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (`json`, `JSON`, ...) up to the first newline
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    body.trim_end().trim_end_matches("```").trim()
}

/// Parses the JSON payload of a model response.
///
/// Accepts bare JSON, fenced JSON, and JSON surrounded by prose (the
/// outermost `{ ... }` span is tried last).
///
/// # Errors
///
/// [`AppError::EmptyResponse`] for blank text and
/// [`AppError::SerializationError`] when no JSON can be decoded.
///
/// ```
/// use lapbot_core::json::parse_llm_json;
///
/// let value = parse_llm_json("```json\n{\"ram\": \"16GB\"}\n```").unwrap();
/// assert_eq!(value["ram"], "16GB");
/// ```
pub fn parse_llm_json(text: &str) -> Result<Value, AppError> {
    let body = strip_code_fences(text);
    if body.is_empty() {
        return Err(AppError::EmptyResponse);
    }

    match serde_json::from_str(body) {
        Ok(value) => Ok(value),
        Err(e) => match (body.find('{'), body.rfind('}')) {
            (Some(start), Some(end)) if start < end => {
                Ok(serde_json::from_str(&body[start..=end])?)
            }
            _ => Err(e.into()),
        },
    }
}

/// Renders a JSON scalar as a CSV cell. `null` becomes `None`.
pub fn value_to_cell(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
