//! Sync Engine
//!
//! Drives one run: lock → load checkpoint → list → per message
//! (fetch, normalize, dedup, append, mark handled, mark read) → persist.
//!
//! Guarantees:
//! - a message is marked handled only after the sheet acknowledged its row
//! - the checkpoint is persisted on every exit path once it was loaded,
//!   so progress made before a fatal error is kept
//! - a row already present in the sheet is never appended again, even if
//!   the checkpoint was lost (self-healing via `LogSink::row_exists`)
//! - cancellation is only observed between messages

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::sync::checkpoint::{Checkpoint, CheckpointStore};
use crate::sync::lock::RunLock;
use crate::sync::normalize::{normalize, Normalized};
use crate::sync::retry::RetryPolicy;
use crate::sync::{EventSource, LogSink};
use crate::types::error::{Result, SyncError};
use crate::types::{CanonicalRecord, Event};

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Start,
    Loaded,
    Listing,
    Normalizing,
    Deduplicating,
    Appending,
    Consuming,
    Persisted,
    Done,
}

/// Counters for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Candidates returned by the mailbox
    pub listed: usize,
    /// Rows appended to the sheet
    pub appended: usize,
    /// Candidates the checkpoint already knew
    pub already_handled: usize,
    /// Rows found in the sheet but missing from the checkpoint
    pub reconciled: usize,
    /// Messages the normalizer declined
    pub skipped: usize,
    /// Messages deleted between listing and fetching
    pub gone: usize,
    /// Rows appended whose mark-as-read call failed
    pub consume_failures: usize,
}

impl RunReport {
    fn log_summary(&self) {
        info!(
            listed = self.listed,
            appended = self.appended,
            already_handled = self.already_handled,
            reconciled = self.reconciled,
            skipped = self.skipped,
            gone = self.gone,
            consume_failures = self.consume_failures,
            "Sync run finished"
        );
    }
}

/// The reconciliation engine
pub struct SyncEngine {
    source: Arc<dyn EventSource>,
    sink: Arc<dyn LogSink>,
    store: CheckpointStore,
    append_retry: RetryPolicy,
    shutdown: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn EventSource>,
        sink: Arc<dyn LogSink>,
        store: CheckpointStore,
        append_retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            sink,
            store,
            append_retry,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between messages; set it to stop the run early
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Execute one complete run
    pub async fn run(&self) -> Result<RunReport> {
        debug!(phase = ?RunPhase::Start, "Starting sync run");
        let _lock = RunLock::acquire(RunLock::path_for(self.store.path()))?;

        let mut checkpoint = self.store.load()?;
        debug!(phase = ?RunPhase::Loaded, handled = checkpoint.handled_count());

        let mut report = RunReport::default();
        let outcome = self.process(&mut checkpoint, &mut report).await;

        checkpoint.touch(Utc::now());
        let persisted = self.store.save(&checkpoint);
        report.log_summary();

        match (outcome, persisted) {
            (Ok(()), Ok(())) => {
                debug!(phase = ?RunPhase::Persisted);
                debug!(phase = ?RunPhase::Done);
                Ok(report)
            }
            (Ok(()), Err(save_err)) => {
                error!("Failed to persist checkpoint: {}", save_err);
                Err(save_err)
            }
            (Err(run_err), Ok(())) => {
                error!("Sync run aborted: {}", run_err);
                Err(run_err)
            }
            (Err(run_err), Err(save_err)) => {
                error!(
                    "Sync run aborted: {}; checkpoint could not be persisted either: {}",
                    run_err, save_err
                );
                Err(run_err)
            }
        }
    }

    async fn process(&self, checkpoint: &mut Checkpoint, report: &mut RunReport) -> Result<()> {
        debug!(phase = ?RunPhase::Listing);
        let candidates = self.source.list_candidates().await?;
        report.listed = candidates.len();
        info!("Found {} unread message(s)", candidates.len());

        let pending = candidates
            .iter()
            .filter(|e| !checkpoint.has_handled(&e.id))
            .count();
        if pending == 0 {
            report.already_handled = candidates.len();
            info!("No new messages to process");
            return Ok(());
        }

        self.sink.prepare().await?;

        for event in &candidates {
            if self.shutdown.load(Ordering::SeqCst) {
                warn!("Shutdown requested, stopping before message {}", event.id);
                return Err(SyncError::Interrupted);
            }
            self.process_event(event, checkpoint, report).await?;
        }

        Ok(())
    }

    /// Critical section for a single message
    async fn process_event(
        &self,
        event: &Event,
        checkpoint: &mut Checkpoint,
        report: &mut RunReport,
    ) -> Result<()> {
        if checkpoint.has_handled(&event.id) {
            debug!(event_id = %event.id, "Already handled, skipping");
            report.already_handled += 1;
            return Ok(());
        }

        debug!(phase = ?RunPhase::Normalizing, event_id = %event.id);
        let raw = match self.source.fetch_body(event).await {
            Ok(raw) => raw,
            Err(e) if !e.is_fatal() => {
                warn!(event_id = %event.id, "Skipping message: {}", e);
                report.gone += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let record = match normalize(event, &raw) {
            Normalized::Record(record) => record,
            Normalized::Skip(reason) => {
                // Not marked handled: a later run may be able to process it
                warn!(event_id = %event.id, "Skipping message: {}", reason);
                report.skipped += 1;
                return Ok(());
            }
        };

        debug!(phase = ?RunPhase::Deduplicating, event_id = %event.id);
        if self.sink.row_exists(&event.id).await? == Some(true) {
            info!(
                event_id = %event.id,
                "Row already in sheet but not in checkpoint, marking handled"
            );
            checkpoint.mark_handled(&event.id);
            report.reconciled += 1;
            self.consume(event, report).await;
            return Ok(());
        }

        debug!(phase = ?RunPhase::Appending, event_id = %event.id);
        self.append(&record).await?;
        checkpoint.mark_handled(&event.id);
        report.appended += 1;
        info!(
            event_id = %event.id,
            "Appended message from {} ({})", record.sender, record.subject
        );

        self.consume(event, report).await;
        Ok(())
    }

    /// Best effort: the row is already committed, so failures only count
    async fn consume(&self, event: &Event, report: &mut RunReport) {
        debug!(phase = ?RunPhase::Consuming, event_id = %event.id);
        if let Err(e) = self.source.mark_consumed(&event.id).await {
            warn!(event_id = %event.id, "Failed to mark message as read: {}", e);
            report.consume_failures += 1;
        }
    }

    async fn append(&self, record: &CanonicalRecord) -> Result<()> {
        let sink = &self.sink;
        self.append_retry
            .run(
                "append row",
                |e: &SyncError| matches!(e, SyncError::SinkUnavailable(_)),
                move || sink.append(record),
            )
            .await
    }
}
