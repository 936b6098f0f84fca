//! Projection of raw mailbox payloads onto the sheet row schema
//!
//! `normalize` is pure and total: any JSON shape produces either a record or
//! a skip, never an error. Missing optional fields become empty strings.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;

use crate::types::{CanonicalRecord, Event, RawPayload};

/// Google Sheets rejects cells longer than this
pub const MAX_CELL_CHARS: usize = 50_000;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Outcome of normalizing one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Record(CanonicalRecord),
    Skip(SkipReason),
}

/// Why a message was not turned into a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingId,
    MissingSubject,
    MissingSender,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingId => write!(f, "message has no id"),
            SkipReason::MissingSubject => write!(f, "message has no subject"),
            SkipReason::MissingSender => write!(f, "message has no sender"),
        }
    }
}

pub fn normalize(event: &Event, raw: &RawPayload) -> Normalized {
    let message = &raw.0;

    if event.id.trim().is_empty() {
        return Normalized::Skip(SkipReason::MissingId);
    }

    let payload = message.get("payload").unwrap_or(&Value::Null);

    let subject = header(payload, "subject");
    if subject.is_empty() {
        return Normalized::Skip(SkipReason::MissingSubject);
    }
    let sender = header(payload, "from");
    if sender.is_empty() {
        return Normalized::Skip(SkipReason::MissingSender);
    }

    let internal_ms = event.timestamp_ms.or_else(|| internal_date_ms(message));
    let date = format_date(&header(payload, "date"), internal_ms);
    let content = truncate_chars(extract_body(payload).trim(), MAX_CELL_CHARS);

    Normalized::Record(CanonicalRecord {
        event_id: event.id.clone(),
        sender,
        subject,
        date,
        content,
    })
}

/// First header with the given name (case-insensitive), trimmed
fn header(payload: &Value, name: &str) -> String {
    payload
        .get("headers")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|h| {
            h.get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
        .and_then(|h| h.get("value"))
        .and_then(Value::as_str)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

/// Gmail reports `internalDate` as a string of epoch milliseconds
fn internal_date_ms(message: &Value) -> Option<i64> {
    match message.get("internalDate")? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn format_date(raw: &str, fallback_ms: Option<i64>) -> String {
    if raw.is_empty() {
        return fallback_ms
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.format(DATE_FORMAT).to_string())
            .unwrap_or_default();
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return dt.format(DATE_FORMAT).to_string();
    }

    // mailparse tolerates the sloppier variants real mailers emit
    mailparse::dateparse(raw)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format(DATE_FORMAT).to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// Plain text body, falling back to HTML rendered as text
fn extract_body(payload: &Value) -> String {
    if let Some(text) = find_part_text(payload, "text/plain") {
        return text;
    }
    if let Some(html) = find_part_text(payload, "text/html") {
        return html2text::from_read(html.as_bytes(), 80).unwrap_or(html);
    }
    String::new()
}

/// Depth-first search for the first part of `mime` with decodable data
fn find_part_text(part: &Value, mime: &str) -> Option<String> {
    let is_match = part
        .get("mimeType")
        .and_then(Value::as_str)
        .is_some_and(|m| m.eq_ignore_ascii_case(mime));

    if is_match {
        let decoded = part
            .get("body")
            .and_then(|b| b.get("data"))
            .and_then(Value::as_str)
            .and_then(decode_part_data);
        if let Some(text) = decoded.filter(|t| !t.trim().is_empty()) {
            return Some(text);
        }
    }

    part.get("parts")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find_map(|child| find_part_text(child, mime))
}

/// Part data is URL-safe base64, padding optional
fn decode_part_data(data: &str) -> Option<String> {
    let cleaned: String = data
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && *c != '=')
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    let bytes = URL_SAFE_NO_PAD.decode(cleaned.as_bytes()).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
