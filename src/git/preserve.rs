//! Paths that survive a retry cleanup.

use anyhow::{Context, Result};
use glob::Pattern;

/// Paths never removed by a selective clean nor counted as dirt: dependency
/// caches and env/secret files at any depth, orchestrator state and logs at
/// the root.
pub const DEFAULT_PRESERVE: &[&str] = &[
    "**/node_modules/**",
    "**/.env*",
    ".sdd-state/**",
    ".sdd/**",
    "logs/**",
    "target/**",
    "**/.venv/**",
];

#[derive(Debug, Clone)]
pub struct PreserveSet {
    patterns: Vec<Pattern>,
}

impl PreserveSet {
    pub fn new<S: AsRef<str>>(globs: &[S]) -> Result<Self> {
        let patterns = globs
            .iter()
            .map(|g| {
                Pattern::new(g.as_ref())
                    .with_context(|| format!("Invalid preserve pattern: {}", g.as_ref()))
            })
            .collect::<Result<_>>()?;
        Ok(Self { patterns })
    }

    /// Whether a repo-relative path (files, or directories with a trailing
    /// `/` as git reports untracked dirs) is preserved.
    pub fn matches(&self, path: &str) -> bool {
        let path = path.trim_end_matches('/');
        // a directory matches `dir/**` through any child path
        let as_dir = format!("{path}/_");
        self.patterns
            .iter()
            .any(|p| p.matches(path) || p.matches(&as_dir))
    }
}

impl Default for PreserveSet {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_PRESERVE
                .iter()
                .filter_map(|g| Pattern::new(g).ok())
                .collect(),
        }
    }
}
