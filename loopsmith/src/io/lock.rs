//! File-based run lock (`.loopsmith/state/run.lock`).
//!
//! Concurrent `loopsmith run` invocations against one repository would drive
//! the same work session twice. The lock file is created exclusively and
//! removed when the guard drops, including during unwinding.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::io::state_store::now_timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: String,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds {} ({})", .path.display(), describe_holder(.info.as_ref()))]
    Held {
        path: PathBuf,
        info: Option<LockInfo>,
    },
    #[error("lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn describe_holder(info: Option<&LockInfo>) -> String {
    match info {
        Some(info) => format!("pid {}, started {}", info.pid, info.started_at),
        None => "holder unknown".to_string(),
    }
}

/// Guard for a held run lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                    info: read_lock(path),
                });
            }
            Err(err) => return Err(io_err(err)),
        };
        let info = LockInfo {
            pid: std::process::id(),
            started_at: now_timestamp(),
        };
        let body = serde_json::to_vec_pretty(&info).unwrap_or_default();
        let lock = Self {
            path: path.to_path_buf(),
        };
        file.write_all(&body).map_err(io_err)?;
        debug!(path = %path.display(), pid = info.pid, "run lock acquired");
        Ok(lock)
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "run lock released"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), err = %err, "failed to release run lock"),
        }
    }
}

/// Read the holder of a lock file, if it exists and parses.
pub fn read_lock(path: &Path) -> Option<LockInfo> {
    let data = fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

/// Remove a stale lock left behind by a killed process. Returns whether a
/// lock file was present.
pub fn force_unlock(path: &Path) -> anyhow::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            warn!(path = %path.display(), "removed run lock");
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_until_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/run.lock");
        let lock = RunLock::acquire(&path).expect("acquire");
        let info = read_lock(&path).expect("lock info");
        assert_eq!(info.pid, std::process::id());

        let err = RunLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
        assert!(err.to_string().contains("another run holds"));

        drop(lock);
        assert!(!path.exists());
        RunLock::acquire(&path).expect("acquire after release");
    }

    #[test]
    fn force_unlock_removes_stale_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.lock");
        fs::write(&path, "garbage").expect("write");
        assert!(matches!(
            RunLock::acquire(&path),
            Err(LockError::Held { info: None, .. })
        ));
        assert!(force_unlock(&path).expect("unlock"));
        assert!(!force_unlock(&path).expect("unlock again"));
    }

    #[test]
    fn lock_released_on_unwind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.lock");
        let result = std::panic::catch_unwind(|| {
            let _lock = RunLock::acquire(&path).expect("acquire");
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(!path.exists());
    }
}
