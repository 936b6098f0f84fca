//! Unified error type for the sync tool
//!
//! Every failure a run can end with maps to one variant here, and every
//! variant maps to a process exit code so schedulers can tell a revoked
//! credential from a flaky network.

use thiserror::Error;

/// Application error type for commands, adapters and the sync engine
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// The bearer credential was rejected and could not be refreshed.
    #[error("Authorization expired: {0}. Run `mail2sheet authorize` to sign in again.")]
    AuthExpired(String),

    #[error("Mailbox unavailable: {0}")]
    SourceUnavailable(String),

    /// The event disappeared between listing and fetching it.
    #[error("Message {0} no longer exists")]
    EventGone(String),

    #[error("Spreadsheet unavailable: {0}")]
    SinkUnavailable(String),

    #[error("Spreadsheet rejected the request: {0}")]
    SinkRejected(String),

    #[error("Another run holds the lock at {0}")]
    AlreadyRunning(String),

    #[error("Checkpoint file is corrupt: {0}")]
    CorruptState(String),

    #[error("Run interrupted")]
    Interrupted,

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Config(_)
            | SyncError::Io(_)
            | SyncError::Parse(_)
            | SyncError::EventGone(_)
            | SyncError::Other(_) => 1,
            SyncError::AuthExpired(_) => 10,
            SyncError::SourceUnavailable(_) => 11,
            SyncError::SinkUnavailable(_) => 12,
            SyncError::SinkRejected(_) => 13,
            SyncError::AlreadyRunning(_) => 14,
            SyncError::CorruptState(_) => 15,
            SyncError::Interrupted => 130,
        }
    }

    /// Whether the error ends the whole run rather than a single event
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::EventGone(_))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Parse(err.to_string())
    }
}

impl From<String> for SyncError {
    fn from(err: String) -> Self {
        SyncError::Other(err)
    }
}

impl From<&str> for SyncError {
    fn from(err: &str) -> Self {
        SyncError::Other(err.to_string())
    }
}

/// Result type alias using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;
