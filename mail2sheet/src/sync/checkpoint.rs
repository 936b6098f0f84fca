//! Durable record of which messages already produced a row
//!
//! The checkpoint is a small JSON document next to the credentials. It is
//! read once at the start of a run, mutated in memory, and written back with
//! an atomic replace so that a crash mid-write leaves the previous state on
//! disk rather than a truncated file.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::types::error::{Result, SyncError};

/// Key names written by earlier versions of the tool
const LEGACY_IDS_KEY: &str = "processed_ids";
const LEGACY_LAST_RUN_KEY: &str = "last_run";

/// In-memory checkpoint state for one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkpoint {
    handled_ids: HashSet<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Fields this version does not know about, written back untouched
    extra: Map<String, Value>,
}

/// On-disk layout
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    handled_ids: Vec<String>,
    #[serde(default)]
    last_run_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl Checkpoint {
    pub fn has_handled(&self, event_id: &str) -> bool {
        self.handled_ids.contains(event_id)
    }

    /// Record an event as handled. Returns false if it already was.
    pub fn mark_handled(&mut self, event_id: &str) -> bool {
        self.handled_ids.insert(event_id.to_string())
    }

    pub fn handled_count(&self) -> usize {
        self.handled_ids.len()
    }

    pub fn handled_ids(&self) -> impl Iterator<Item = &str> {
        self.handled_ids.iter().map(String::as_str)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_run_at = Some(now);
    }

    fn from_file(mut file: CheckpointFile) -> Result<Self> {
        let mut handled_ids: HashSet<String> = file.handled_ids.into_iter().collect();

        // Migrate key names written by earlier versions
        if let Some(legacy) = file.extra.remove(LEGACY_IDS_KEY) {
            let ids: Vec<String> = serde_json::from_value(legacy).map_err(|e| {
                SyncError::CorruptState(format!("{} is not a list of ids: {}", LEGACY_IDS_KEY, e))
            })?;
            debug!(count = ids.len(), "Merged legacy processed ids");
            handled_ids.extend(ids);
        }
        let mut last_run_at = file.last_run_at;
        if let Some(legacy) = file.extra.remove(LEGACY_LAST_RUN_KEY) {
            if last_run_at.is_none() {
                last_run_at = legacy.as_str().and_then(parse_legacy_timestamp);
            }
        }

        Ok(Self {
            handled_ids,
            last_run_at,
            extra: file.extra,
        })
    }

    fn to_file(&self) -> CheckpointFile {
        let mut handled_ids: Vec<String> = self.handled_ids.iter().cloned().collect();
        handled_ids.sort();
        CheckpointFile {
            handled_ids,
            last_run_at: self.last_run_at,
            extra: self.extra.clone(),
        }
    }
}

/// Earlier versions wrote a naive local `isoformat()` timestamp
fn parse_legacy_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| naive.and_local_timezone(Local).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

/// File-backed checkpoint persistence
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint. A missing file is a fresh, empty checkpoint.
    pub fn load(&self) -> Result<Checkpoint> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No checkpoint at {:?}, starting fresh", self.path);
                return Ok(Checkpoint::default());
            }
            Err(e) => return Err(SyncError::Io(format!("Failed to read {:?}: {}", self.path, e))),
        };

        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(SyncError::CorruptState(format!("{:?} is empty", self.path)));
        }

        let file: CheckpointFile = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::CorruptState(format!("{:?}: {}", self.path, e)))?;
        let checkpoint = Checkpoint::from_file(file)?;

        info!(
            handled = checkpoint.handled_count(),
            "Loaded checkpoint from {:?}", self.path
        );
        Ok(checkpoint)
    }

    /// Write the checkpoint by replacing the file atomically
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&checkpoint.to_file())?;
        write_atomic(&self.path, &bytes)?;

        debug!(
            handled = checkpoint.handled_count(),
            "Saved checkpoint to {:?}", self.path
        );
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        tmp_path_for(&self.path)
    }
}

/// Replace `path` with `bytes` so readers see either the old or the new
/// content, never a partial file
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    replace_file(path, bytes, false)
}

/// Like `write_atomic`, but the content is never readable by other users,
/// not even while it sits in the temp file
pub(crate) fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    replace_file(path, bytes, true)
}

fn replace_file(path: &Path, bytes: &[u8], private: bool) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = tmp_path_for(path);
    {
        let mut file = create_tmp(&tmp_path, private)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    sync_parent_dir(path);
    Ok(())
}

#[cfg(unix)]
fn create_tmp(path: &Path, private: bool) -> std::io::Result<File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    if !private {
        return options.open(path);
    }
    let file = options.mode(0o600).open(path)?;
    // `mode` only applies on creation; a leftover temp file keeps its bits
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn create_tmp(path: &Path, _private: bool) -> std::io::Result<File> {
    File::create(path)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "checkpoint".into());
    name.push(".tmp");
    path.with_file_name(name)
}

// Makes the rename itself durable on filesystems that need it
#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            warn!("Could not sync directory {:?}: {}", parent, e);
        }
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}
