//! Cooperative run locking.
//!
//! Only one process may mutate a given output root at a time. The lock is an
//! advisory `flock` on `<output_root>/.state.lock` via the `fs2` crate, with
//! the holder's PID and start time embedded in the file as JSON so a human
//! (or `status`) can see who owns it.
//!
//! Advisory locks release when the holder dies, so a crashed run never wedges
//! the output root. The embedded payload covers the remaining case: a lock
//! file on a filesystem whose flock is held by an unreachable peer. Payloads
//! older than the configured stale age are reclaimed by unlinking the inode
//! and locking a fresh one.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use notemill_protocol::defaults::STATE_LOCK_NAME;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Output root is locked by another run (pid {pid:?}, started {started_at:?}): {path}")]
    Held {
        path: PathBuf,
        pid: Option<u32>,
        started_at: Option<DateTime<Utc>>,
    },

    #[error("Failed to create lock file: {0}")]
    CreateFailed(#[source] io::Error),

    #[error("Failed to acquire lock: {0}")]
    AcquireFailed(#[source] io::Error),
}

/// Payload embedded in the lock file.
#[derive(Debug, Serialize, Deserialize)]
struct LockPayload {
    pid: u32,
    started_at: DateTime<Utc>,
    exe: Option<String>,
}

/// A guard holding the exclusive run lock. Released on drop.
pub struct RunLockGuard {
    _file: File,
    lock_path: PathBuf,
}

impl RunLockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        debug!("Releasing run lock: {}", self.lock_path.display());
        // The flock releases when the file closes; the payload is blanked so
        // a later reader does not mistake it for a live holder.
        if let Err(e) = fs::remove_file(&self.lock_path) {
            debug!(
                "Failed to remove lock file {}: {}",
                self.lock_path.display(),
                e
            );
        }
    }
}

impl std::fmt::Debug for RunLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLockGuard")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

pub fn lock_path_for(output_root: &Path) -> PathBuf {
    output_root.join(STATE_LOCK_NAME)
}

/// Try to acquire the run lock for an output root. Non-blocking: a held lock
/// is reported immediately with the recorded holder, unless its payload is
/// older than `stale_age`, in which case the lock is reclaimed once.
pub fn try_acquire_run_lock(
    output_root: &Path,
    stale_age: Duration,
) -> Result<RunLockGuard, LockError> {
    let lock_path = lock_path_for(output_root);
    fs::create_dir_all(output_root).map_err(LockError::CreateFailed)?;

    match try_flock(&lock_path) {
        Ok(guard) => Ok(guard),
        Err(LockError::Held {
            path,
            pid,
            started_at,
        }) => {
            let is_stale = started_at
                .map(|t| {
                    Utc::now().signed_duration_since(t).num_seconds()
                        > stale_age.as_secs() as i64
                })
                .unwrap_or(false);
            if !is_stale {
                return Err(LockError::Held {
                    path,
                    pid,
                    started_at,
                });
            }
            // flock is per-inode: unlink the stale file and lock a new one.
            warn!(
                "Reclaiming stale lock {} (pid {:?}, started {:?})",
                path.display(),
                pid,
                started_at
            );
            let _ = fs::remove_file(&path);
            try_flock(&lock_path)
        }
        Err(e) => Err(e),
    }
}

fn try_flock(lock_path: &Path) -> Result<RunLockGuard, LockError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(LockError::CreateFailed)?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            let payload = LockPayload {
                pid: std::process::id(),
                started_at: Utc::now(),
                exe: std::env::current_exe()
                    .ok()
                    .map(|p| p.display().to_string()),
            };
            file.set_len(0).map_err(LockError::AcquireFailed)?;
            let bytes = serde_json::to_vec_pretty(&payload)
                .map_err(|e| LockError::AcquireFailed(io::Error::new(io::ErrorKind::Other, e)))?;
            file.write_all(&bytes).map_err(LockError::AcquireFailed)?;
            file.flush().map_err(LockError::AcquireFailed)?;
            info!("Acquired run lock: {}", lock_path.display());
            Ok(RunLockGuard {
                _file: file,
                lock_path: lock_path.to_path_buf(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            let (pid, started_at) = read_holder(lock_path);
            Err(LockError::Held {
                path: lock_path.to_path_buf(),
                pid,
                started_at,
            })
        }
        Err(e) => Err(LockError::AcquireFailed(e)),
    }
}

fn read_holder(lock_path: &Path) -> (Option<u32>, Option<DateTime<Utc>>) {
    let Ok(content) = fs::read_to_string(lock_path) else {
        return (None, None);
    };
    match serde_json::from_str::<LockPayload>(&content) {
        Ok(payload) => (Some(payload.pid), Some(payload.started_at)),
        Err(_) => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let guard = try_acquire_run_lock(dir.path(), Duration::from_secs(3600)).unwrap();
        assert!(guard.lock_path().exists());
        drop(guard);
        // Reacquirable after release.
        let _guard2 = try_acquire_run_lock(dir.path(), Duration::from_secs(3600)).unwrap();
    }

    #[test]
    fn test_lock_contention_reports_holder() {
        let dir = TempDir::new().unwrap();
        let _guard = try_acquire_run_lock(dir.path(), Duration::from_secs(3600)).unwrap();

        let err = try_acquire_run_lock(dir.path(), Duration::from_secs(3600)).unwrap_err();
        match err {
            LockError::Held { pid, .. } => {
                assert_eq!(pid, Some(std::process::id()));
            }
            other => panic!("expected Held, got {other:?}"),
        }
    }

    #[test]
    fn test_payload_written() {
        let dir = TempDir::new().unwrap();
        let guard = try_acquire_run_lock(dir.path(), Duration::from_secs(3600)).unwrap();
        let content = fs::read_to_string(guard.lock_path()).unwrap();
        let payload: LockPayload = serde_json::from_str(&content).unwrap();
        assert_eq!(payload.pid, std::process::id());
    }
}
