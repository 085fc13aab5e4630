//! The code-generation agent seen from the orchestrator: a prompt goes in,
//! free text comes out.
//!
//! [`ClaudeAgent`] drives the `claude` CLI. Tests substitute
//! [`testing::ScriptedAgent`], which replays canned responses.

mod claude;
#[cfg(test)]
pub mod testing;

pub use claude::ClaudeAgent;

use crate::signals::{Signals, extract_signals};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// One invocation of the agent.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub model: Option<String>,
    /// Working directory the agent operates in
    pub cwd: PathBuf,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            cwd: cwd.into(),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }
}

/// What the agent returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    pub text: String,
    pub exit_code: i32,
}

impl AgentOutput {
    pub fn new(text: impl Into<String>, exit_code: i32) -> Self {
        Self {
            text: text.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn signals(&self) -> Signals {
        extract_signals(&self.text)
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput>;
}

/// Write the prompt and the response of one invocation next to each other:
/// `<stem>-prompt.md` and `<stem>-output.log`.
pub fn write_transcript(stem: &Path, request: &AgentRequest, output: &AgentOutput) -> Result<()> {
    if let Some(dir) = stem.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    }
    let stem = stem.to_string_lossy();
    std::fs::write(format!("{stem}-prompt.md"), &request.prompt)
        .context("Failed to write prompt log")?;
    std::fs::write(
        format!("{stem}-output.log"),
        format!("exit code: {}\n\n{}", output.exit_code, output.text),
    )
    .context("Failed to write output log")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalKey;
    use tempfile::tempdir;

    #[test]
    fn test_output_signals() {
        let out = AgentOutput::new("did things\nFEATURE_BUILT: Dashboard\n", 0);
        assert!(out.success());
        assert_eq!(out.signals().get(SignalKey::FeatureBuilt), "Dashboard");
    }

    #[test]
    fn test_write_transcript() {
        let dir = tempdir().unwrap();
        let stem = dir.path().join("logs").join("feature-2-attempt-1");
        let request = AgentRequest::new("build it", dir.path());
        let output = AgentOutput::new("BUILD_FAILED: nope", 1);
        write_transcript(&stem, &request, &output).unwrap();

        let prompt =
            std::fs::read_to_string(dir.path().join("logs/feature-2-attempt-1-prompt.md")).unwrap();
        assert_eq!(prompt, "build it");
        let log =
            std::fs::read_to_string(dir.path().join("logs/feature-2-attempt-1-output.log")).unwrap();
        assert!(log.starts_with("exit code: 1"));
        assert!(log.contains("BUILD_FAILED"));
    }
}
