use super::campaign;
use super::evaluator::{EvalStats, Evaluator};
use crate::errors::SidecarError;
use crate::git::GitOps;
use anyhow::Result;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the sentinel is checked while waiting for the next poll.
const SENTINEL_CHECK: Duration = Duration::from_millis(500);

/// Why the wait between polls ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Elapsed,
    Drain,
    Cancelled,
}

/// What a finished loop did.
#[derive(Debug, Clone, Default)]
pub struct LoopReport {
    pub stats: EvalStats,
    pub drained: bool,
    pub campaign_file: Option<PathBuf>,
}

/// Polls HEAD for new commits and evaluates them until drained or
/// cancelled.
pub struct SidecarLoop {
    git: GitOps,
    evaluator: Evaluator,
    sentinel: PathBuf,
    eval_dir: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
    draining: bool,
}

impl SidecarLoop {
    pub fn new(
        git: GitOps,
        evaluator: Evaluator,
        sentinel: impl Into<PathBuf>,
        eval_dir: impl Into<PathBuf>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            git,
            evaluator,
            sentinel: sentinel.into(),
            eval_dir: eval_dir.into(),
            interval,
            cancel,
            draining: false,
        }
    }

    /// Run to completion. The campaign summary is written on every exit
    /// path, including cancellation.
    pub async fn run(mut self) -> Result<LoopReport> {
        std::fs::create_dir_all(&self.eval_dir)?;
        if self.sentinel.exists() {
            info!(path = %self.sentinel.display(), "Removing stale drain sentinel");
            std::fs::remove_file(&self.sentinel)?;
        }

        let start = self
            .git
            .head_sha()
            .ok_or_else(|| SidecarError::NoHead(self.git.workdir().to_path_buf()))?;
        info!(commit = %&start[..start.len().min(8)], "Sidecar starting from commit");

        let mut last_head = start.clone();
        let mut evaluated: HashSet<String> = HashSet::new();

        loop {
            if self.cancel.is_cancelled() {
                info!("Shutdown requested");
                break;
            }
            if !self.draining && self.sentinel.exists() {
                self.begin_drain();
            }
            if !self.draining {
                match self.wait_for_poll().await {
                    Wake::Cancelled => {
                        info!("Shutdown requested");
                        break;
                    }
                    Wake::Drain => self.begin_drain(),
                    Wake::Elapsed => {}
                }
            }

            let Some(head) = self.git.head_sha() else {
                if self.draining {
                    warn!("Could not read HEAD during drain, finishing");
                    break;
                }
                warn!("Could not read HEAD, will retry next cycle");
                continue;
            };

            if head == last_head {
                if self.draining {
                    break;
                }
                continue;
            }

            let pending: Vec<String> = match self.git.commits_between(&start, &head) {
                Ok(commits) => commits
                    .into_iter()
                    .filter(|c| !evaluated.contains(c))
                    .collect(),
                Err(e) => {
                    warn!(error = %e, "Could not list new commits");
                    Vec::new()
                }
            };
            debug!(count = pending.len(), "New commits");

            for sha in pending {
                if self.cancel.is_cancelled() {
                    break;
                }
                self.evaluator.evaluate(&self.git, &sha).await;
                evaluated.insert(sha);
            }
            last_head = head;
        }

        let stats = self.evaluator.stats();
        info!(
            evaluated = stats.evaluated,
            errors = stats.errors,
            skipped = stats.skipped,
            "Sidecar shutting down"
        );

        let campaign_file = match campaign::generate(&self.eval_dir) {
            Ok(written) => written.map(|(_, path)| path),
            Err(e) => {
                warn!(error = %e, "Failed to write campaign summary");
                None
            }
        };

        if self.draining {
            info!("Drain complete, all commits evaluated");
            if self.sentinel.exists() {
                std::fs::remove_file(&self.sentinel)?;
            }
        }

        Ok(LoopReport {
            stats,
            drained: self.draining,
            campaign_file,
        })
    }

    fn begin_drain(&mut self) {
        info!("Drain sentinel detected, processing remaining commits");
        self.draining = true;
    }

    /// Sleep for one poll interval, waking early for a drain or shutdown.
    async fn wait_for_poll(&self) -> Wake {
        let deadline = Instant::now() + self.interval;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Wake::Elapsed;
            }
            let step = SENTINEL_CHECK.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => return Wake::Cancelled,
                _ = sleep(step) => {}
            }
            if self.sentinel.exists() {
                return Wake::Drain;
            }
        }
    }
}
