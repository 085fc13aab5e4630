//! `claude` CLI invocation.

use super::{Agent, AgentOutput, AgentRequest};
use crate::errors::OrchestratorError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

pub struct ClaudeAgent {
    command: String,
    flags: Vec<String>,
    skip_permissions: bool,
    timeout: Duration,
}

impl ClaudeAgent {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            flags: Vec::new(),
            skip_permissions: true,
            timeout,
        }
    }

    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_skip_permissions(mut self, skip: bool) -> Self {
        self.skip_permissions = skip;
        self
    }

    /// Arguments for one invocation; the prompt itself goes over stdin.
    pub fn args(&self, model: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.extend(self.flags.iter().cloned());
        args
    }
}

/// Pull `.result` out of the CLI's JSON envelope. Output that is not an
/// envelope (crashes, proxy errors, rate-limit notices) is returned as-is so
/// pattern checks still see it.
pub fn extract_result(stdout: &str) -> Option<String> {
    let json = find_json_object(stdout)?;
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    match value.get("result")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => Some(String::new()),
        other => Some(other.to_string()),
    }
}

/// Locate the outermost JSON object in text that may carry other content,
/// ignoring braces inside string literals.
fn find_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[async_trait]
impl Agent for ClaudeAgent {
    #[instrument(skip_all, fields(command = %self.command, model = ?request.model))]
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput> {
        let mut child = Command::new(&self.command)
            .args(self.args(request.model.as_deref()))
            .current_dir(&request.cwd)
            // a nested session refuses to start when this is inherited
            .env_remove("CLAUDECODE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(OrchestratorError::AgentSpawn)?;

        if let Some(mut stdin) = child.stdin.take()
            && let Err(e) = stdin.write_all(request.prompt.as_bytes()).await
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            return Err(e).context("Failed to write prompt to agent stdin");
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to wait for agent")?,
            Err(_) => {
                warn!(secs = self.timeout.as_secs(), "agent timed out, killed");
                return Err(OrchestratorError::AgentTimeout {
                    secs: self.timeout.as_secs(),
                }
                .into());
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut text = match extract_result(&stdout) {
            Some(result) => result,
            None => stdout.to_string(),
        };
        if exit_code != 0 && !stderr.trim().is_empty() {
            text.push('\n');
            text.push_str(&stderr);
        }

        debug!(exit_code, chars = text.len(), "agent finished");
        Ok(AgentOutput { text, exit_code })
    }
}
