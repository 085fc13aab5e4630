//! Running validation commands.
//!
//! Argv commands are spawned directly. Only [`CommandSpec::Shell`] goes
//! through `sh -c`.

use crate::project_config::CommandSpec;
use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Result of one validation command.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// stdout followed by stderr
    pub output: String,
    pub timed_out: bool,
}

impl CommandOutcome {
    /// The outcome recorded when a stage has no command configured.
    pub fn skipped() -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            output: String::new(),
            timed_out: false,
        }
    }
}

fn build_command(spec: &CommandSpec) -> Result<Command> {
    match spec {
        CommandSpec::Argv(args) => {
            let Some((program, rest)) = args.split_first() else {
                bail!("Empty command");
            };
            let mut cmd = Command::new(program);
            cmd.args(rest);
            Ok(cmd)
        }
        CommandSpec::Shell { shell } => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(shell);
            Ok(cmd)
        }
    }
}

/// Run `spec` in `cwd`, killing it when `limit` elapses.
///
/// A non-zero exit or a timeout is reported through the outcome; only a
/// failure to spawn is an error.
#[instrument(skip_all, fields(command = %spec.display(), timeout_secs = limit.as_secs()))]
pub async fn run_command(spec: &CommandSpec, cwd: &Path, limit: Duration) -> Result<CommandOutcome> {
    let mut cmd = build_command(spec)?;
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn command: {}", spec.display()))?;

    match timeout(limit, child.wait_with_output()).await {
        Ok(result) => {
            let output = result.context("Failed to wait for command")?;
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            debug!(exit_code = ?output.status.code(), "command finished");
            Ok(CommandOutcome {
                success: output.status.success(),
                exit_code: output.status.code(),
                output: text,
                timed_out: false,
            })
        }
        Err(_) => {
            // dropping the wait future drops the child, which kills it
            warn!("command timed out, killed");
            Ok(CommandOutcome {
                success: false,
                exit_code: None,
                output: format!(
                    "Command timed out after {}s: {}",
                    limit.as_secs(),
                    spec.display()
                ),
                timed_out: true,
            })
        }
    }
}
