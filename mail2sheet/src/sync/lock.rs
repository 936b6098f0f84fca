//! Advisory lock preventing two runs from sharing one checkpoint
//!
//! The lock is an OS file lock on an open handle, so the kernel drops it
//! when the holding process exits for any reason. The file itself stays
//! behind and only carries the holder's pid for diagnostics.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::types::error::{Result, SyncError};

/// Held for the duration of a run; released when dropped
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    /// Lock file used for a given checkpoint path
    pub fn path_for(checkpoint: &Path) -> PathBuf {
        let mut name = checkpoint
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".lock");
        checkpoint.with_file_name(name)
    }

    /// Take the lock, failing fast if another run holds it
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = open_lock_file(&path)?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                return Err(SyncError::AlreadyRunning(format!(
                    "{} (pid {})",
                    path.display(),
                    holder.trim()
                )));
            }
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }

        // A previous holder that was killed leaves its pid behind
        if let Err(e) = write_pid(&mut file) {
            warn!("Failed to record pid in run lock {:?}: {}", path, e);
        }
        debug!("Acquired run lock {:?}", path);
        Ok(Self { path, file })
    }

    /// Whether some process currently holds the lock at `path`
    pub fn is_held(path: &Path) -> bool {
        let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
            return false;
        };
        matches!(file.try_lock(), Err(TryLockError::WouldBlock))
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn write_pid(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.set_len(0) {
            warn!("Failed to clear run lock {:?}: {}", self.path, e);
        }
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release run lock {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path_sits_next_to_checkpoint() {
        let lock = RunLock::path_for(Path::new("/data/state.json"));
        assert_eq!(lock, PathBuf::from("/data/state.json.lock"));
    }

    #[test]
    fn test_second_acquire_fails_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json.lock");

        let first = RunLock::acquire(&path).unwrap();
        assert!(RunLock::is_held(&path));
        let err = RunLock::acquire(&path).unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning(_)));
        assert!(err.to_string().contains(&std::process::id().to_string()));

        drop(first);
        assert!(!RunLock::is_held(&path));
        assert!(RunLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_file_left_by_killed_run_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json.lock");
        // What a run killed with SIGKILL leaves behind: the file, no lock
        fs::write(&path, "4242\n").unwrap();

        assert!(!RunLock::is_held(&path));
        let lock = RunLock::acquire(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap().trim(),
            std::process::id().to_string()
        );
        drop(lock);
    }

    #[test]
    fn test_closing_the_handle_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json.lock");

        // Another holder that exits without any cleanup code running
        let other = open_lock_file(&path).unwrap();
        other.try_lock().unwrap();
        assert!(RunLock::is_held(&path));
        assert!(matches!(
            RunLock::acquire(&path),
            Err(SyncError::AlreadyRunning(_))
        ));

        drop(other);
        assert!(!RunLock::is_held(&path));
        assert!(RunLock::acquire(&path).is_ok());
    }
}
