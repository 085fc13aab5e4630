//! Single-instance mutual exclusion through a PID file.
//!
//! At most one orchestrator may own a project's working tree. The lock file
//! holds the owner's PID; a lock whose PID is no longer running is stale and
//! is taken over with a warning. The file is also `flock`ed for as long as
//! the guard lives.
//!
//! Known limitation: there is a window between reading a stale PID and
//! writing our own in which a second starter could interleave. This is an
//! operator-driven tool, not a contended service, so the window is accepted.

use crate::errors::OrchestratorError;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Whether a process with `pid` currently exists.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs existence and permission checks only; no
    // signal is delivered.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Read the PID recorded in a lock file, if it holds a parseable one.
pub fn read_lock_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Held lock. Dropping the guard releases the lock and removes the file.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    file: Option<File>,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly; equivalent to dropping the guard.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
        release(&self.path);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Acquire the project lock at `path`.
///
/// Fails with [`OrchestratorError::LockContention`] without touching the file
/// when the recorded PID is alive. A dead or unreadable PID is overwritten.
pub fn acquire(path: &Path) -> Result<LockGuard> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create lock directory: {}", parent.display()))?;
    }

    if path.exists() {
        match read_lock_pid(path) {
            Some(pid) if process_alive(pid) => {
                return Err(OrchestratorError::LockContention {
                    pid,
                    path: path.to_path_buf(),
                }
                .into());
            }
            Some(pid) => warn!(pid, "Removing stale lock file (PID no longer running)"),
            None => warn!(path = %path.display(), "Replacing unreadable lock file"),
        }
    }

    // truncate only once the flock is held
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

    if file.try_lock_exclusive().is_err() {
        return Err(OrchestratorError::LockContention {
            pid: read_lock_pid(path).unwrap_or(0),
            path: path.to_path_buf(),
        }
        .into());
    }

    file.set_len(0).context("Failed to truncate lock file")?;
    writeln!(file, "{}", std::process::id()).context("Failed to write PID to lock file")?;
    file.sync_all().context("Failed to sync lock file")?;

    debug!(path = %path.display(), pid = std::process::id(), "acquired lock");
    Ok(LockGuard {
        path: path.to_path_buf(),
        file: Some(file),
    })
}

/// Remove the lock file unconditionally.
pub fn release(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "released lock"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove lock file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_creates_file_with_own_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build.lock");

        let guard = acquire(&path).unwrap();
        assert!(path.exists());
        assert_eq!(read_lock_pid(&path), Some(std::process::id()));
        drop(guard);
    }

    #[test]
    fn test_release_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build.lock");

        let guard = acquire(&path).unwrap();
        guard.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build.lock");
        {
            let _guard = acquire(&path).unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_live_pid_blocks_without_modifying_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build.lock");
        let live = format!("{}\n", std::process::id());
        fs::write(&path, &live).unwrap();

        let err = acquire(&path).unwrap_err();
        match err.downcast_ref::<OrchestratorError>() {
            Some(OrchestratorError::LockContention { pid, .. }) => {
                assert_eq!(*pid, std::process::id())
            }
            other => panic!("expected LockContention, got {other:?}"),
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), live);
    }

    #[test]
    fn test_dead_pid_is_taken_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build.lock");
        fs::write(&path, "99999999\n").unwrap();

        let _guard = acquire(&path).unwrap();
        assert_eq!(read_lock_pid(&path), Some(std::process::id()));
    }

    #[test]
    fn test_garbage_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build.lock");
        fs::write(&path, "not a pid").unwrap();

        let _guard = acquire(&path).unwrap();
        assert_eq!(read_lock_pid(&path), Some(std::process::id()));
    }

    #[test]
    fn test_flock_contention_keeps_holder_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("build.lock");
        // a PID that reads as dead, but whose holder still has the flock
        fs::write(&path, "99999999\n").unwrap();
        let holder = File::open(&path).unwrap();
        holder.lock_exclusive().unwrap();

        let err = acquire(&path).unwrap_err();
        match err.downcast_ref::<OrchestratorError>() {
            Some(OrchestratorError::LockContention { pid, .. }) => assert_eq!(*pid, 99_999_999),
            other => panic!("expected LockContention, got {other:?}"),
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "99999999\n");
        holder.unlock().unwrap();
    }

    #[test]
    fn test_release_missing_file_is_noop() {
        let dir = tempdir().unwrap();
        release(&dir.path().join("never.lock"));
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(99_999_999));
        assert!(!process_alive(0));
    }
}
