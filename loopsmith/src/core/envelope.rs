//! Strict extraction of JSON envelopes from free-text agent replies.
//!
//! Agent replies are never trusted to be well-formed. Extraction is a
//! parse-then-validate step: locate a candidate JSON object, parse it, and
//! validate it against a JSON Schema. Every failure is a typed error so the
//! caller can take its fallback path.

use std::sync::LazyLock;

use jsonschema::validator_for;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n(.*?)```").expect("fence regex is valid")
});

/// Why an envelope could not be extracted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("no JSON object found in reply")]
    NotFound,
    #[error("malformed JSON envelope: {0}")]
    Malformed(String),
    #[error("envelope does not match schema: {}", .0.join("; "))]
    SchemaViolation(Vec<String>),
}

/// Extract and schema-validate the JSON envelope in `text`.
///
/// Prefers the last fenced code block that parses as JSON; otherwise uses the
/// span from the first `{` to the last `}`.
pub fn extract_envelope(text: &str, schema: &Value) -> Result<Value, EnvelopeError> {
    let value = locate_json(text)?;
    let validator =
        validator_for(schema).map_err(|err| EnvelopeError::Malformed(format!("schema: {err}")))?;
    let messages: Vec<String> = validator
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(EnvelopeError::SchemaViolation(messages));
    }
    Ok(value)
}

/// [`extract_envelope`] followed by typed deserialization.
pub fn extract_typed<T: DeserializeOwned>(text: &str, schema: &Value) -> Result<T, EnvelopeError> {
    let value = extract_envelope(text, schema)?;
    serde_json::from_value(value).map_err(|err| EnvelopeError::Malformed(err.to_string()))
}

fn locate_json(text: &str) -> Result<Value, EnvelopeError> {
    let mut last_error = None;
    for caps in FENCED_JSON_RE.captures_iter(text).collect::<Vec<_>>().iter().rev() {
        let Some(body) = caps.get(1) else { continue };
        match serde_json::from_str::<Value>(body.as_str().trim()) {
            Ok(value) if value.is_object() => return Ok(value),
            Ok(_) => last_error = Some("fenced block is not a JSON object".to_string()),
            Err(err) => last_error = Some(err.to_string()),
        }
    }

    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(match last_error {
            Some(reason) => EnvelopeError::Malformed(reason),
            None => EnvelopeError::NotFound,
        });
    };
    if end < start {
        return Err(EnvelopeError::NotFound);
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .map_err(|err| EnvelopeError::Malformed(err.to_string()))
}
