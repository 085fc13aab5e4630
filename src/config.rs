use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::git::{DEFAULT_PRESERVE, PreserveSet};
use crate::project_config::{BranchStrategy, SddToml, SidecarSection, ValidationSection};
use crate::retry::RetryPolicy;

/// Runtime configuration for autosdd.
///
/// Built once per process from the project directory, `.sdd/autosdd.toml`,
/// the environment (including `<project>/.env`) and CLI flags, in increasing
/// precedence. Every component receives it by reference.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub sdd_dir: PathBuf,
    pub roadmap_file: PathBuf,
    pub state_dir: PathBuf,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    /// Committed forensic copy of the state file; never read back
    pub checkpoint_file: PathBuf,
    pub drain_sentinel: PathBuf,
    pub log_dir: PathBuf,
    pub eval_dir: PathBuf,
    pub agent_cmd: String,
    pub model: Option<String>,
    pub drift_model: Option<String>,
    pub review_model: Option<String>,
    pub agent_flags: Vec<String>,
    pub skip_permissions: bool,
    pub agent_timeout: Duration,
    pub strategy: BranchStrategy,
    pub base_branch: Option<String>,
    pub branch_prefix: String,
    pub prune_merged: bool,
    pub retry: RetryPolicy,
    pub validation: ValidationSection,
    pub sidecar: SidecarSection,
    pub preserve: PreserveSet,
    pub verbose: bool,
}

/// Flags from the `run` subcommand that override file and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub strategy: Option<BranchStrategy>,
    pub max_retries: Option<u32>,
    pub no_sidecar: bool,
}

impl Config {
    /// Load configuration for `project_dir` from disk and the process
    /// environment.
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        // .env never overrides variables already set in the environment
        let _ = dotenvy::from_path(project_dir.join(".env"));

        let toml = SddToml::load_or_default(&project_dir.join(".sdd"))?;
        let mut config = Self::from_toml(project_dir, toml, verbose)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Build from an already-parsed file, without consulting the environment.
    pub fn from_toml(project_dir: PathBuf, toml: SddToml, verbose: bool) -> Result<Self> {
        let sdd_dir = project_dir.join(".sdd");
        let state_dir = project_dir.join(".sdd-state");
        let log_dir = project_dir.join(toml.paths.logs.as_deref().unwrap_or("logs"));
        let roadmap_file = project_dir.join(
            toml.paths
                .roadmap
                .as_deref()
                .unwrap_or(".specs/roadmap.md"),
        );

        let mut globs: Vec<String> = DEFAULT_PRESERVE.iter().map(|g| g.to_string()).collect();
        globs.extend(toml.paths.preserve.iter().cloned());
        if let Ok(rel) = log_dir.strip_prefix(&project_dir) {
            globs.push(format!("{}/**", rel.display()));
        }
        let preserve = PreserveSet::new(&globs)?;

        Ok(Self {
            state_file: state_dir.join("resume.json"),
            lock_file: state_dir.join("build.lock"),
            drain_sentinel: state_dir.join("eval-drain"),
            checkpoint_file: sdd_dir.join("checkpoint").join("resume.json"),
            eval_dir: log_dir.join("evals"),
            agent_cmd: toml
                .agent
                .command
                .clone()
                .unwrap_or_else(|| "claude".to_string()),
            model: toml.agent.model.clone(),
            drift_model: toml.agent.drift_model.clone(),
            review_model: toml.agent.review_model.clone(),
            agent_flags: toml.agent.flags.clone(),
            skip_permissions: toml.agent.skip_permissions,
            agent_timeout: Duration::from_secs(toml.agent.timeout_secs),
            strategy: toml.branches.strategy,
            base_branch: toml.branches.base_branch.clone(),
            branch_prefix: toml.branches.prefix.clone(),
            prune_merged: toml.branches.prune_merged,
            retry: RetryPolicy::from(&toml.retry),
            validation: toml.validation,
            sidecar: toml.sidecar,
            preserve,
            verbose,
            project_dir,
            sdd_dir,
            state_dir,
            log_dir,
            roadmap_file,
        })
    }

    /// Apply `AUTOSDD_*` variables through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(cmd) = lookup("AUTOSDD_AGENT_CMD") {
            self.agent_cmd = cmd;
        }
        if let Some(model) = lookup("AUTOSDD_MODEL") {
            self.model = Some(model);
        }
        if let Some(raw) = lookup("AUTOSDD_MAX_RETRIES") {
            self.retry.max_retries = raw
                .trim()
                .parse()
                .with_context(|| format!("AUTOSDD_MAX_RETRIES must be a number, got '{raw}'"))?;
        }
        if let Some(raw) = lookup("AUTOSDD_MIN_RETRY_DELAY") {
            let secs: u64 = raw.trim().parse().with_context(|| {
                format!("AUTOSDD_MIN_RETRY_DELAY must be seconds, got '{raw}'")
            })?;
            self.retry.min_retry_delay = Duration::from_secs(secs);
        }
        if let Some(raw) = lookup("AUTOSDD_STRATEGY") {
            self.strategy = raw.parse()?;
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, overrides: &CliOverrides) {
        if let Some(strategy) = overrides.strategy {
            self.strategy = strategy;
        }
        if let Some(max) = overrides.max_retries {
            self.retry.max_retries = max;
        }
        if overrides.no_sidecar {
            self.sidecar.enabled = false;
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.eval_dir).context("Failed to create eval directory")?;
        Ok(())
    }

    /// Path stem for one agent call's transcript, e.g.
    /// `logs/feature-3-attempt-1-build`.
    pub fn transcript_stem(&self, feature_id: u32, attempt: u32, stage: &str) -> PathBuf {
        self.log_dir
            .join(format!("feature-{feature_id}-attempt-{attempt}-{stage}"))
    }

    /// `path` relative to the project root, for git operations.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.project_dir).unwrap_or(path)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.validation.command_timeout_secs)
    }
}
