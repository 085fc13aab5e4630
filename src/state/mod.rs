//! Crash-safe persistence of run progress.
//!
//! The live state file is the only thing the next invocation trusts. It is
//! replaced atomically (temp file in the same directory, then rename) after
//! every committed feature and removed once the queue is exhausted. A copy
//! committed into git history is forensic only and never read back.

use crate::errors::OrchestratorError;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Persisted progress of a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub feature_index: usize,
    pub branch_strategy: String,
    pub completed_features: Vec<String>,
    pub current_branch: String,
    #[serde(default)]
    pub timestamp: String,
}

impl RunState {
    pub fn new(branch_strategy: impl Into<String>, current_branch: impl Into<String>) -> Self {
        Self {
            feature_index: 0,
            branch_strategy: branch_strategy.into(),
            completed_features: Vec::new(),
            current_branch: current_branch.into(),
            timestamp: now_timestamp(),
        }
    }

    /// Record a completed feature. Names already present are not added again.
    pub fn record_completed(&mut self, name: &str) {
        if !self.is_completed(name) {
            self.completed_features.push(name.to_string());
        }
    }

    pub fn is_completed(&self, name: &str) -> bool {
        self.completed_features.iter().any(|n| n == name)
    }
}

fn now_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Reads and writes the run state file.
pub struct StateStore {
    state_file: PathBuf,
}

impl StateStore {
    pub fn new(state_file: PathBuf) -> Self {
        Self { state_file }
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    /// Persist `state` atomically, stamping the current time.
    ///
    /// The written file is parsed back before returning; a file that does not
    /// round-trip is a hard error.
    pub fn write(&self, state: &RunState) -> Result<()> {
        let dir = self
            .state_file
            .parent()
            .context("State file path has no parent directory")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        let mut stamped = state.clone();
        stamped.timestamp = now_timestamp();
        let mut data =
            serde_json::to_string_pretty(&stamped).context("Failed to serialize run state")?;
        data.push('\n');

        let mut tmp = tempfile::Builder::new()
            .prefix(".resume-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .context("Failed to create temp state file")?;
        tmp.write_all(data.as_bytes())
            .context("Failed to write temp state file")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to sync temp state file")?;
        tmp.persist(&self.state_file)
            .with_context(|| format!("Failed to move state into {}", self.state_file.display()))?;

        let written = self
            .read()?
            .context("State file vanished immediately after write")?;
        if written.completed_features != stamped.completed_features
            || written.feature_index != stamped.feature_index
        {
            anyhow::bail!(
                "State file {} did not round-trip after write",
                self.state_file.display()
            );
        }

        debug!(
            index = stamped.feature_index,
            completed = stamped.completed_features.len(),
            "wrote run state"
        );
        Ok(())
    }

    /// Load the previous run's state. `Ok(None)` means there was no prior
    /// run; a file that exists but does not parse is reported as
    /// [`OrchestratorError::StateCorrupt`] rather than treated as absent.
    pub fn read(&self) -> Result<Option<RunState>> {
        if !self.state_file.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.state_file)
            .with_context(|| format!("Failed to read state file: {}", self.state_file.display()))?;

        let state: RunState =
            serde_json::from_str(&content).map_err(|source| OrchestratorError::StateCorrupt {
                path: self.state_file.clone(),
                source,
            })?;
        Ok(Some(state))
    }

    /// Remove the state file once the whole queue is done.
    pub fn clean(&self) -> Result<()> {
        if self.state_file.exists() {
            fs::remove_file(&self.state_file).context("Failed to remove state file")?;
            info!(path = %self.state_file.display(), "removed run state");
        }
        Ok(())
    }

    /// Copy the live state into `dest` so it can be committed as a checkpoint.
    pub fn copy_to(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&self.state_file, dest)
            .with_context(|| format!("Failed to copy state to {}", dest.display()))?;
        Ok(())
    }
}
