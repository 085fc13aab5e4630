//! Project configuration file for autosdd.
//!
//! Read from `.sdd/autosdd.toml`. Every section and field is optional; a
//! missing file yields the defaults shown here:
//!
//! ```toml
//! [agent]
//! command = "claude"
//! model = "claude-sonnet-4"
//! flags = []
//! skip_permissions = true
//! timeout_secs = 1800
//!
//! [retry]
//! max_retries = 1
//! min_retry_delay_secs = 30
//! rate_limit_max_retries = 5
//! backoff_cap_secs = 60
//! failure_context_chars = 4000
//!
//! [branches]
//! strategy = "chained"
//! prefix = "auto/feature-"
//! prune_merged = true
//!
//! [validation]
//! build = ["npm", "run", "build"]
//! test = { shell = "npm test 2>&1 | tail -n 50" }
//! drift = true
//! review = false
//! parallel_drift = false
//! command_timeout_secs = 600
//!
//! [[validation.advisory]]
//! name = "lint"
//! command = ["npm", "run", "lint"]
//!
//! [sidecar]
//! enabled = true
//! interval_secs = 30
//! agent_eval = true
//! drain_timeout_secs = 120
//!
//! [paths]
//! roadmap = ".specs/roadmap.md"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How feature branches are laid out across a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStrategy {
    /// Each feature branches from the previous feature's branch
    #[default]
    Chained,
    /// Each feature branches from the base branch
    Independent,
    /// All features are built on the current branch
    Sequential,
}

impl std::fmt::Display for BranchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchStrategy::Chained => write!(f, "chained"),
            BranchStrategy::Independent => write!(f, "independent"),
            BranchStrategy::Sequential => write!(f, "sequential"),
        }
    }
}

impl std::str::FromStr for BranchStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chained" => Ok(BranchStrategy::Chained),
            "independent" => Ok(BranchStrategy::Independent),
            "sequential" => Ok(BranchStrategy::Sequential),
            _ => anyhow::bail!(
                "Invalid branch strategy '{}'. Valid values: chained, independent, sequential",
                s
            ),
        }
    }
}

/// A command to run. An array is executed directly as an argv; a table with
/// a `shell` key is handed to `sh -c` and is the only way to get pipes or
/// redirection. Config files are operator-controlled, which is what makes
/// the shell form acceptable at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Argv(Vec<String>),
    Shell { shell: String },
}

impl CommandSpec {
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::Argv(args.into_iter().map(Into::into).collect())
    }

    pub fn shell(script: impl Into<String>) -> Self {
        CommandSpec::Shell {
            shell: script.into(),
        }
    }

    /// Human-readable rendering for logs.
    pub fn display(&self) -> String {
        match self {
            CommandSpec::Argv(args) => args.join(" "),
            CommandSpec::Shell { shell } => format!("sh -c '{shell}'"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent CLI command (default: "claude")
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Model for drift checks; falls back to `model`
    #[serde(default)]
    pub drift_model: Option<String>,
    /// Model for advisory code review; falls back to `model`
    #[serde(default)]
    pub review_model: Option<String>,
    /// Extra flags appended to every invocation
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default = "default_true")]
    pub skip_permissions: bool,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_agent_timeout() -> u64 {
    1800
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: None,
            model: None,
            drift_model: None,
            review_model: None,
            flags: Vec::new(),
            skip_permissions: true,
            timeout_secs: default_agent_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Retries per feature after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_min_retry_delay")]
    pub min_retry_delay_secs: u64,
    #[serde(default = "default_rate_limit_max_retries")]
    pub rate_limit_max_retries: u32,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// Tail of the previous failure injected into the next attempt
    #[serde(default = "default_failure_context_chars")]
    pub failure_context_chars: usize,
}

fn default_max_retries() -> u32 {
    1
}

fn default_min_retry_delay() -> u64 {
    30
}

fn default_rate_limit_max_retries() -> u32 {
    5
}

fn default_backoff_cap() -> u64 {
    60
}

fn default_failure_context_chars() -> usize {
    4000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            min_retry_delay_secs: default_min_retry_delay(),
            rate_limit_max_retries: default_rate_limit_max_retries(),
            backoff_cap_secs: default_backoff_cap(),
            failure_context_chars: default_failure_context_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchesSection {
    #[serde(default)]
    pub strategy: BranchStrategy,
    /// Branch features start from; defaults to the branch checked out at
    /// run start
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default = "default_branch_prefix")]
    pub prefix: String,
    #[serde(default = "default_true")]
    pub prune_merged: bool,
}

fn default_branch_prefix() -> String {
    "auto/feature-".to_string()
}

impl Default for BranchesSection {
    fn default() -> Self {
        Self {
            strategy: BranchStrategy::default(),
            base_branch: None,
            prefix: default_branch_prefix(),
            prune_merged: true,
        }
    }
}

/// A non-blocking check; failures only warn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryCheck {
    pub name: String,
    pub command: CommandSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSection {
    #[serde(default)]
    pub build: Option<CommandSpec>,
    #[serde(default)]
    pub test: Option<CommandSpec>,
    #[serde(default)]
    pub advisory: Vec<AdvisoryCheck>,
    /// Run the agent-driven drift check after tests pass
    #[serde(default = "default_true")]
    pub drift: bool,
    /// Run the advisory agent code review after drift
    #[serde(default)]
    pub review: bool,
    /// Fan drift checks out across a worker pool (independent strategy only)
    #[serde(default)]
    pub parallel_drift: bool,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    600
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            build: None,
            test: None,
            advisory: Vec::new(),
            drift: true,
            review: false,
            parallel_drift: false,
            command_timeout_secs: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sidecar_interval")]
    pub interval_secs: u64,
    /// Escalate mechanical evals to an agent judgment
    #[serde(default = "default_true")]
    pub agent_eval: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

fn default_sidecar_interval() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    120
}

impl Default for SidecarSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sidecar_interval(),
            agent_eval: true,
            model: None,
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsSection {
    /// Roadmap table, relative to the project (default: .specs/roadmap.md)
    #[serde(default)]
    pub roadmap: Option<String>,
    /// Log directory, relative to the project (default: logs)
    #[serde(default)]
    pub logs: Option<String>,
    /// Extra globs spared by the retry cleanup, added to the built-in set
    #[serde(default)]
    pub preserve: Vec<String>,
}

/// The complete autosdd.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SddToml {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub branches: BranchesSection,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub sidecar: SidecarSection,
    #[serde(default)]
    pub paths: PathsSection,
}

impl SddToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse autosdd.toml")
    }

    /// Load `<sdd_dir>/autosdd.toml`, or defaults when it does not exist.
    pub fn load_or_default(sdd_dir: &Path) -> Result<Self> {
        let config_path = sdd_dir.join("autosdd.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.validation.build.is_none() {
            warnings.push("No [validation].build command; build success is unverified".into());
        }
        if self.validation.test.is_none() {
            warnings.push("No [validation].test command; test success is unverified".into());
        }
        if self.validation.parallel_drift && self.branches.strategy != BranchStrategy::Independent
        {
            warnings.push(format!(
                "parallel_drift only applies to the independent strategy (current: {})",
                self.branches.strategy
            ));
        }
        for cmd in self
            .validation
            .build
            .iter()
            .chain(self.validation.test.iter())
            .chain(self.validation.advisory.iter().map(|a| &a.command))
        {
            if matches!(cmd, CommandSpec::Argv(args) if args.is_empty()) {
                warnings.push("Empty command array in [validation]".into());
            }
        }
        if self.retry.backoff_cap_secs == 0 {
            warnings.push("backoff_cap_secs = 0 disables rate-limit backoff delays".into());
        }

        warnings
    }
}
