use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;

use crate::config::AppConfig;
use crate::credentials::TokenStore;
use crate::sync::checkpoint::CheckpointStore;
use crate::sync::lock::RunLock;
use crate::types::error::Result;

/// Read-only snapshot of local state
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub checkpoint_path: PathBuf,
    pub handled: usize,
    pub last_run_at: Option<DateTime<Utc>>,
    pub lock_held: bool,
    pub authorized: bool,
    pub spreadsheet_id: String,
    pub sheet_name: String,
}

pub fn status(config: &AppConfig) -> Result<StatusReport> {
    let store = CheckpointStore::new(&config.paths.checkpoint);
    let checkpoint = store.load()?;

    Ok(StatusReport {
        checkpoint_path: store.path().to_path_buf(),
        handled: checkpoint.handled_count(),
        last_run_at: checkpoint.last_run_at,
        lock_held: RunLock::is_held(&RunLock::path_for(store.path())),
        authorized: TokenStore::new(&config.paths.token).exists(),
        spreadsheet_id: config.sink.spreadsheet_id.clone(),
        sheet_name: config.sink.sheet_name.clone(),
    })
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Checkpoint:   {}", self.checkpoint_path.display())?;
        writeln!(f, "Handled:      {}", self.handled)?;
        match self.last_run_at {
            Some(at) => writeln!(f, "Last run:     {}", at.format("%Y-%m-%d %H:%M:%S UTC"))?,
            None => writeln!(f, "Last run:     never")?,
        }
        writeln!(
            f,
            "Run lock:     {}",
            if self.lock_held { "held" } else { "free" }
        )?;
        writeln!(
            f,
            "Authorized:   {}",
            if self.authorized { "yes" } else { "no (run `mail2sheet authorize`)" }
        )?;
        write!(f, "Destination:  {} / {}", self.spreadsheet_id, self.sheet_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::checkpoint::Checkpoint;
    use crate::types::error::SyncError;
    use chrono::TimeZone;

    fn config_in(dir: &tempfile::TempDir) -> AppConfig {
        let content = r#"
            [sink]
            spreadsheet_id = "abc"
        "#;
        AppConfig::from_toml_str(content, Some(dir.path())).unwrap()
    }

    #[test]
    fn test_status_of_fresh_install() {
        let dir = tempfile::tempdir().unwrap();
        let report = status(&config_in(&dir)).unwrap();

        assert_eq!(report.handled, 0);
        assert!(report.last_run_at.is_none());
        assert!(!report.lock_held);
        assert!(!report.authorized);
        assert!(report.to_string().contains("never"));
        // Status never creates files
        assert!(!report.checkpoint_path.exists());
    }

    #[test]
    fn test_status_reports_checkpoint_and_lock() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        let store = CheckpointStore::new(&config.paths.checkpoint);

        let mut checkpoint = Checkpoint::default();
        checkpoint.mark_handled("a");
        checkpoint.mark_handled("b");
        checkpoint.touch(Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap());
        store.save(&checkpoint).unwrap();
        let _lock = RunLock::acquire(RunLock::path_for(store.path())).unwrap();

        let report = status(&config).unwrap();
        assert_eq!(report.handled, 2);
        assert!(report.lock_held);
        let text = report.to_string();
        assert!(text.contains("2024-06-01 08:30:00 UTC"));
        assert!(text.contains("held"));
        assert!(text.contains("abc / Sheet1"));
    }

    #[test]
    fn test_status_surfaces_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        std::fs::create_dir_all(config.paths.checkpoint.parent().unwrap()).unwrap();
        std::fs::write(&config.paths.checkpoint, "garbage").unwrap();

        assert!(matches!(status(&config), Err(SyncError::CorruptState(_))));
    }
}
