use crate::config::Config;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{info, warn};

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Draining,
    Stopped,
}

/// How the sidecar ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Exited on its own after seeing the sentinel
    Drained,
    /// Needed SIGTERM; it still wrote a best-effort summary
    Terminated,
    /// Ignored SIGTERM and was killed
    Killed,
    /// Had already exited before the drain began
    AlreadyExited,
}

/// Handle to a running evaluation sidecar.
pub struct SidecarSession {
    child: Child,
    pid: Option<u32>,
    sentinel: PathBuf,
    drain_timeout: Duration,
    state: SessionState,
}

impl SidecarSession {
    /// Launch `<current exe> sidecar --project-dir <dir>`.
    pub fn spawn(config: &Config) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate autosdd executable")?;
        let mut cmd = Command::new(exe);
        cmd.arg("sidecar").arg("--project-dir").arg(&config.project_dir);
        if config.verbose {
            cmd.arg("--verbose");
        }
        Self::spawn_command(
            cmd,
            &config.drain_sentinel,
            Duration::from_secs(config.sidecar.drain_timeout_secs),
        )
    }

    /// Launch an arbitrary command as the sidecar process.
    pub fn spawn_command(mut cmd: Command, sentinel: &Path, drain_timeout: Duration) -> Result<Self> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let child = cmd.spawn().context("Failed to spawn eval sidecar")?;
        let pid = child.id();
        info!(pid = ?pid, "Eval sidecar started");
        Ok(Self {
            child,
            pid,
            sentinel: sentinel.to_path_buf(),
            drain_timeout,
            state: SessionState::Running,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Ask the sidecar to finish outstanding evaluations and exit.
    ///
    /// Writes the drain sentinel and waits up to the drain timeout; a sidecar
    /// still running after that receives SIGTERM, then SIGKILL.
    pub async fn drain(mut self) -> Result<DrainOutcome> {
        if let Some(status) = self.child.try_wait()? {
            info!(%status, "Eval sidecar had already exited");
            self.state = SessionState::Stopped;
            return Ok(DrainOutcome::AlreadyExited);
        }

        if let Some(parent) = self.sentinel.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.sentinel, b"")
            .with_context(|| format!("Failed to write drain sentinel {}", self.sentinel.display()))?;
        self.state = SessionState::Draining;
        info!(
            timeout_secs = self.drain_timeout.as_secs(),
            "Draining eval sidecar"
        );

        if let Ok(status) = timeout(self.drain_timeout, self.child.wait()).await {
            let status = status.context("Failed to wait for eval sidecar")?;
            info!(%status, "Eval sidecar drained");
            self.state = SessionState::Stopped;
            return Ok(DrainOutcome::Drained);
        }

        warn!(
            timeout_secs = self.drain_timeout.as_secs(),
            "Eval sidecar did not drain in time, sending SIGTERM"
        );
        if let Some(pid) = self.pid {
            terminate(pid);
        }
        let outcome = match timeout(TERM_GRACE, self.child.wait()).await {
            Ok(_) => DrainOutcome::Terminated,
            Err(_) => {
                warn!("Eval sidecar ignored SIGTERM, killing");
                self.child.kill().await.context("Failed to kill eval sidecar")?;
                DrainOutcome::Killed
            }
        };
        // the sidecar removes the sentinel itself only after a clean drain
        let _ = std::fs::remove_file(&self.sentinel);
        self.state = SessionState::Stopped;
        Ok(outcome)
    }
}

fn terminate(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn shell(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_cooperative_drain() {
        let dir = tempdir().unwrap();
        let sentinel = dir.path().join("state/eval-drain");
        let script = format!(
            "while [ ! -f '{0}' ]; do sleep 0.05; done; rm '{0}'",
            sentinel.display()
        );
        let session =
            SidecarSession::spawn_command(shell(&script), &sentinel, Duration::from_secs(10))
                .unwrap();
        assert_eq!(session.state(), SessionState::Running);
        assert!(session.pid().is_some());

        assert_eq!(session.drain().await.unwrap(), DrainOutcome::Drained);
        assert!(!sentinel.exists());
    }

    #[tokio::test]
    async fn test_unresponsive_sidecar_is_terminated() {
        let dir = tempdir().unwrap();
        let sentinel = dir.path().join("eval-drain");
        let session =
            SidecarSession::spawn_command(shell("exec sleep 30"), &sentinel, Duration::from_millis(200))
                .unwrap();

        assert_eq!(session.drain().await.unwrap(), DrainOutcome::Terminated);
        assert!(!sentinel.exists());
    }

    #[tokio::test]
    async fn test_exited_sidecar_needs_no_drain() {
        let dir = tempdir().unwrap();
        let sentinel = dir.path().join("eval-drain");
        let mut session =
            SidecarSession::spawn_command(shell("exit 0"), &sentinel, Duration::from_secs(1))
                .unwrap();
        session.child.wait().await.unwrap();

        assert_eq!(session.drain().await.unwrap(), DrainOutcome::AlreadyExited);
        assert!(!sentinel.exists());
    }
}
