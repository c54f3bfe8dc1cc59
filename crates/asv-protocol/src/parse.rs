//! Parsing agent transcript JSON lines.
//!
//! Each line of a transcript is one self-contained JSON object with a `type`
//! tag and a payload. The shapes vary by agent version, so every field is
//! optional and content is extracted best-effort.

use asv_core::{parse_timestamp, Message, SessionId};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Role used when a record carries neither `message.role` nor `type`.
pub const UNKNOWN_ROLE: &str = "unknown";

/// Errors produced while parsing one transcript line.
#[derive(Debug, Error)]
pub enum RecordParseError {
    /// The line is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The line is valid JSON but not an object.
    #[error("record is not a JSON object")]
    NotAnObject,
}

/// Raw transcript record.
///
/// All fields are optional to handle records from different agent versions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRecord {
    /// Record type tag (`user`, `assistant`, `summary`, `system`, ...)
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    /// Chat message envelope used by user/assistant records, or plain text
    /// on some system records
    #[serde(default)]
    pub message: Option<Value>,
    /// Flat content used by simpler records
    #[serde(default)]
    pub content: Option<Value>,
    /// Summary text on `summary` records
    #[serde(default)]
    pub summary: Option<String>,
}

/// Parses one transcript line.
///
/// # Errors
///
/// Returns `RecordParseError` if the line is not a JSON object.
pub fn parse_record(line: &str) -> Result<RawRecord, RecordParseError> {
    let value: Value = serde_json::from_str(line)?;
    if !value.is_object() {
        return Err(RecordParseError::NotAnObject);
    }
    Ok(serde_json::from_value(value)?)
}

impl RawRecord {
    /// Returns the message role: `message.role`, then `type`, then "unknown".
    pub fn role(&self) -> &str {
        self.message
            .as_ref()
            .and_then(|m| m.get("role"))
            .and_then(Value::as_str)
            .or(self.kind.as_deref())
            .filter(|r| !r.is_empty())
            .unwrap_or(UNKNOWN_ROLE)
    }

    /// Returns the parsed record timestamp, if present and well-formed.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_ref()
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    /// Extracts display text from whichever content field the record uses.
    pub fn text(&self) -> String {
        match &self.message {
            Some(Value::String(text)) => return text.clone(),
            Some(body) => {
                if let Some(content) = body.get("content") {
                    return content_text(content);
                }
            }
            None => {}
        }
        if let Some(content) = &self.content {
            return content_text(content);
        }
        self.summary.clone().unwrap_or_default()
    }

    /// Converts into a domain message at the given position.
    pub fn into_message(self, session_id: SessionId, ordinal: u64) -> Message {
        Message {
            session_id,
            ordinal,
            timestamp: self.timestamp(),
            role: self.role().to_string(),
            content: self.text(),
        }
    }
}

/// Flattens a content value into text.
///
/// Strings pass through; arrays of blocks contribute `text` blocks verbatim,
/// `tool_use` blocks as `[tool: name]`, and `tool_result` blocks through
/// their nested content.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(block_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn block_text(block: &Value) -> Option<String> {
    if let Value::String(s) = block {
        return Some(s.clone());
    }
    match block.get("type").and_then(Value::as_str) {
        Some("text") => block.get("text").and_then(Value::as_str).map(str::to_string),
        Some("thinking") => block
            .get("thinking")
            .and_then(Value::as_str)
            .map(str::to_string),
        Some("tool_use") => block
            .get("name")
            .and_then(Value::as_str)
            .map(|name| format!("[tool: {name}]")),
        Some("tool_result") => block.get("content").map(content_text),
        _ => None,
    }
}
