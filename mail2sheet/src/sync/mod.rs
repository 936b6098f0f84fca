//! Mailbox → spreadsheet sync engine
//!
//! The engine only talks to the mailbox and the spreadsheet through the two
//! traits below, so the reconciliation logic can be exercised without a
//! network.

pub mod checkpoint;
pub mod engine;
pub mod lock;
pub mod normalize;
pub mod retry;

use async_trait::async_trait;

use crate::types::error::Result;
use crate::types::{CanonicalRecord, Event, RawPayload};

/// Source of unread messages
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Currently unread candidates. Order is not meaningful.
    async fn list_candidates(&self) -> Result<Vec<Event>>;

    /// Full payload; `SyncError::EventGone` if the message vanished
    async fn fetch_body(&self, event: &Event) -> Result<RawPayload>;

    /// Flag the message as read. Best-effort: callers only log failures.
    async fn mark_consumed(&self, event_id: &str) -> Result<()>;
}

/// Append-only destination for rows
#[async_trait]
pub trait LogSink: Send + Sync {
    /// One-time setup before the first append of a run
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Append one row. Success means the sink acknowledged the write.
    async fn append(&self, record: &CanonicalRecord) -> Result<()>;

    /// Whether a row for this event already exists; `None` when the sink
    /// cannot tell
    async fn row_exists(&self, _event_id: &str) -> Result<Option<bool>> {
        Ok(None)
    }
}
