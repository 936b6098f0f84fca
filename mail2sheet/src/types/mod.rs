pub mod error;

use serde::{Deserialize, Serialize};

/// Header row written to an empty sheet. The last column carries the
/// message id so existing rows can be matched against new events.
pub const SHEET_HEADERS: [&str; 5] = ["From", "Subject", "Date", "Content", "Message ID"];

/// An unread message as listed by the mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Provider-assigned unique id
    pub id: String,
    /// Provider receive time in milliseconds since the epoch, when known
    pub timestamp_ms: Option<i64>,
}

impl Event {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp_ms: None,
        }
    }
}

/// Full provider payload of a message, as returned by the mailbox API.
///
/// Kept as untyped JSON so that the normalizer, not the transport,
/// decides what a malformed message looks like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPayload(pub serde_json::Value);

/// A message projected onto the spreadsheet's row schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub event_id: String,
    pub sender: String,
    pub subject: String,
    pub date: String,
    pub content: String,
}

impl CanonicalRecord {
    /// Cell values in sheet column order
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.sender.clone(),
            self.subject.clone(),
            self.date.clone(),
            self.content.clone(),
            self.event_id.clone(),
        ]
    }
}
