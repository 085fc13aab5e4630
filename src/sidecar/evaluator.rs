use super::result::{AgentEval, EvalRecord, MechanicalEval};
use crate::agent::{Agent, AgentRequest};
use crate::git::GitOps;
use crate::prompt::{DEFAULT_CONTEXT_TOKENS, eval_prompt, load_for_context};
use crate::retry::BackoffController;
use anyhow::Result;
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

static TYPE_EXPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"export\s+(?:type|interface)\s+(\w+)").unwrap());
static CONVENTIONAL_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| {
        Regex::new(r"^(?:feat|fix|chore|refactor|docs|test|style|perf|build|ci|revert)(?:\([^)]*\))?!?:\s*")
            .unwrap()
    });

/// Diffs beyond this many bytes are cut before going into an eval prompt.
const MAX_PROMPT_DIFF_BYTES: usize = 200_000;

pub fn is_test_file(path: &str) -> bool {
    path.contains("test") || path.contains("spec") || path.contains("__tests__")
}

/// Type and interface names exported on added lines, first occurrence order.
pub fn extract_type_names(diff: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for line in diff.lines().filter(|l| l.starts_with('+')) {
        if let Some(caps) = TYPE_EXPORT_RE.captures(line) {
            let name = caps[1].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

pub fn count_imports(diff: &str) -> usize {
    diff.lines()
        .filter(|l| l.starts_with('+') && !l.starts_with("+++") && l.contains("import "))
        .count()
}

/// Commit summary with a leading conventional-commit type removed
/// (`feat: Login` -> `Login`, `fix(auth): Login` -> `Login`).
pub fn feature_name_from_summary(summary: &str) -> String {
    CONVENTIONAL_PREFIX_RE.replace(summary, "").to_string()
}

/// Measure `sha`. Merge commits yield `None`.
pub fn mechanical_eval(git: &GitOps, sha: &str) -> Result<Option<MechanicalEval>> {
    let parents = git.parent_count(sha)?;
    if parents > 1 {
        info!(commit = %short(sha), "Skipping merge commit");
        return Ok(None);
    }

    let stats = git.diff_numstat(sha)?;
    let diff = git.diff_text(sha)?;
    let files: Vec<String> = stats.iter().map(|s| s.path.clone()).collect();
    let type_names = extract_type_names(&diff);

    let mut redeclared = Vec::new();
    if let Some(parent) = git.first_parent(sha)? {
        for name in &type_names {
            if git.type_declared_in_tree(&parent, name)? {
                redeclared.push(name.clone());
            }
        }
    }

    Ok(Some(MechanicalEval {
        commit: sha.to_string(),
        feature_name: feature_name_from_summary(&git.commit_summary(sha)?),
        files_changed: stats.len(),
        lines_added: stats.iter().map(|s| s.added).sum(),
        lines_removed: stats.iter().map(|s| s.removed).sum(),
        new_type_exports: type_names.len(),
        type_redeclarations: redeclared.len(),
        redeclared_type_names: redeclared,
        import_count: count_imports(&diff),
        test_files_touched: files.iter().any(|f| is_test_file(f)),
        files,
    }))
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(8)]
}

/// Counters kept across a sidecar's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalStats {
    pub evaluated: usize,
    pub errors: usize,
    pub skipped: usize,
}

/// Evaluates commits one at a time and writes a record per feature.
pub struct Evaluator {
    project_dir: PathBuf,
    eval_dir: PathBuf,
    agent: Option<Arc<dyn Agent>>,
    model: Option<String>,
    backoff: BackoffController,
    /// Commits touching only paths under this prefix are bookkeeping
    bookkeeping_prefix: Option<String>,
    agent_disabled: bool,
    stats: EvalStats,
}

impl Evaluator {
    pub fn new(project_dir: impl Into<PathBuf>, eval_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            eval_dir: eval_dir.into(),
            agent: None,
            model: None,
            backoff: BackoffController::new(0, std::time::Duration::ZERO),
            bookkeeping_prefix: None,
            agent_disabled: false,
            stats: EvalStats::default(),
        }
    }

    /// Escalate every mechanical eval to `agent`.
    pub fn with_agent(
        mut self,
        agent: Arc<dyn Agent>,
        model: Option<String>,
        backoff: BackoffController,
    ) -> Self {
        self.agent = Some(agent);
        self.model = model;
        self.backoff = backoff;
        self
    }

    pub fn with_bookkeeping_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.bookkeeping_prefix = Some(prefix.into());
        self
    }

    pub fn stats(&self) -> EvalStats {
        self.stats
    }

    pub fn agent_disabled(&self) -> bool {
        self.agent_disabled
    }

    /// Evaluate one commit. Failures are logged and counted, never returned;
    /// the result path is returned when a record was written.
    pub async fn evaluate(&mut self, git: &GitOps, sha: &str) -> Option<PathBuf> {
        let mechanical = match mechanical_eval(git, sha) {
            Ok(Some(m)) => m,
            Ok(None) => {
                self.stats.skipped += 1;
                return None;
            }
            Err(e) => {
                warn!(commit = %short(sha), error = %e, "Mechanical eval failed, skipping commit");
                self.stats.errors += 1;
                return None;
            }
        };

        if self.is_bookkeeping(&mechanical) {
            self.stats.skipped += 1;
            return None;
        }

        info!(
            commit = %short(sha),
            feature = %mechanical.feature_name,
            files = mechanical.files_changed,
            "Evaluating commit"
        );

        let agent_eval = match git.diff_text(sha) {
            Ok(diff) => self.agent_eval(sha, &diff).await,
            Err(e) => {
                warn!(commit = %short(sha), error = %e, "Could not read diff for agent eval");
                None
            }
        };

        let record = EvalRecord::new(mechanical, agent_eval);
        match record.write(&self.eval_dir) {
            Ok(path) => {
                self.stats.evaluated += 1;
                info!(commit = %short(sha), path = %path.display(), "Eval complete");
                Some(path)
            }
            Err(e) => {
                warn!(commit = %short(sha), error = %e, "Failed to write eval result");
                self.stats.errors += 1;
                None
            }
        }
    }

    fn is_bookkeeping(&self, mechanical: &MechanicalEval) -> bool {
        let Some(prefix) = &self.bookkeeping_prefix else {
            return false;
        };
        !mechanical.files.is_empty() && mechanical.files.iter().all(|f| f.starts_with(prefix))
    }

    async fn agent_eval(&mut self, sha: &str, diff: &str) -> Option<AgentEval> {
        if self.agent_disabled {
            return None;
        }
        let agent = self.agent.clone()?;

        let prompt = eval_prompt(
            sha,
            truncate_bytes(diff, MAX_PROMPT_DIFF_BYTES),
            &load_for_context(&self.project_dir.join("CLAUDE.md"), DEFAULT_CONTEXT_TOKENS),
            &load_for_context(
                &self.project_dir.join(".specs/learnings/index.md"),
                DEFAULT_CONTEXT_TOKENS,
            ),
        );
        let request =
            AgentRequest::new(prompt, self.project_dir.as_path()).with_model(self.model.clone());

        let outcome = match self.backoff.invoke(agent.as_ref(), &request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(commit = %short(sha), error = %e, "Agent eval failed, mechanical only");
                self.stats.errors += 1;
                return None;
            }
        };

        if let Some(matched) = outcome.credit_exhausted {
            warn!(
                matched = %matched,
                "API credits exhausted, disabling agent evals for the rest of the run"
            );
            self.agent_disabled = true;
            return None;
        }
        if !outcome.output.success() {
            warn!(
                commit = %short(sha),
                exit_code = outcome.output.exit_code,
                "Agent eval failed, mechanical only"
            );
            self.stats.errors += 1;
            return None;
        }

        AgentEval::from_signals(&outcome.output.signals())
    }
}

fn truncate_bytes(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
