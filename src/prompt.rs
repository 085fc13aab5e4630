//! Prompt assembly and context-budget truncation.
//!
//! The wording is deliberately plain; what matters to the orchestrator is
//! that each prompt asks for the signal lines its stage evaluates.

use crate::dag::ScheduledFeature;
use regex::Regex;
use std::fmt::Write;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

/// Default token budget for documents inlined into a prompt.
pub const DEFAULT_CONTEXT_TOKENS: usize = 100_000;

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^#+\s").unwrap());
static GHERKIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(Feature|Scenario|Given|When|Then|And|But|Background|Rule)[:\s]").unwrap()
});

/// Shrink `content` to fit a context budget.
///
/// Tokens are estimated at four characters each. Content within half of
/// `max_tokens` is returned unchanged; anything larger is reduced to its
/// frontmatter, headings, bold lines and Gherkin keyword lines.
pub fn truncate_for_context(content: &str, max_tokens: usize) -> String {
    let estimated = content.len() / 4;
    if estimated <= max_tokens / 2 {
        return content.to_string();
    }
    warn!(
        estimated_tokens = estimated,
        budget = max_tokens,
        "Document exceeds half the context budget, keeping structure and scenarios only"
    );

    let mut kept = Vec::new();
    let mut fences = 0;
    let mut in_frontmatter = false;

    for line in content.lines() {
        if line.trim_end() == "---" {
            fences += 1;
            if fences <= 2 {
                kept.push(line);
                in_frontmatter = fences == 1;
                continue;
            }
        }
        if in_frontmatter
            || HEADING_RE.is_match(line)
            || GHERKIN_RE.is_match(line)
            || line.starts_with("**")
        {
            kept.push(line);
        }
    }
    kept.join("\n")
}

/// Read `path` through [`truncate_for_context`]. Missing files read as empty.
pub fn load_for_context(path: &Path, max_tokens: usize) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => truncate_for_context(&content, max_tokens),
        Err(_) => String::new(),
    }
}

/// Everything that goes into one build prompt.
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub feature: &'a ScheduledFeature,
    /// 0-based attempt
    pub attempt: u32,
    pub prior_failure: Option<&'a str>,
    pub feedback: Option<&'a str>,
    pub roadmap: Option<&'a str>,
}

impl<'a> PromptContext<'a> {
    pub fn new(feature: &'a ScheduledFeature) -> Self {
        Self {
            feature,
            attempt: 0,
            prior_failure: None,
            feedback: None,
            roadmap: None,
        }
    }

    pub fn build_prompt(&self) -> String {
        let f = self.feature;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Build roadmap feature #{}: {} (complexity: {}).",
            f.id, f.name, f.complexity
        );
        out.push_str(
            "Write or update the feature spec, implement it with tests, and commit your work.\n",
        );

        if let Some(roadmap) = self.roadmap.filter(|r| !r.is_empty()) {
            let _ = write!(out, "\n## Roadmap\n\n{roadmap}\n");
        }

        if let Some(feedback) = self.feedback.filter(|f| !f.is_empty()) {
            let _ = write!(
                out,
                "\n## Feedback from evaluation of earlier features\n\n{feedback}\n"
            );
        }

        if let Some(failure) = self.prior_failure {
            let _ = write!(
                out,
                "\n## Previous attempt failed (attempt {})\n\nFix the cause below before anything else.\n\n```\n{}\n```\n",
                self.attempt,
                failure.trim()
            );
        }

        out.push_str(
            "\nWhen done, end your response with these lines:\n\
             FEATURE_BUILT: <feature name>\n\
             SPEC_FILE: <path to the feature spec>\n\
             SOURCE_FILES: <comma-separated source paths>\n\
             If you cannot finish, end with BUILD_FAILED: <reason> instead.\n",
        );
        out
    }
}

pub fn drift_prompt(feature: &ScheduledFeature, spec_file: &str, source_files: &str) -> String {
    format!(
        "Check feature #{} ({}) for drift between its spec and implementation.\n\
         Spec: {spec_file}\nSources: {source_files}\n\n\
         If they agree, end with NO_DRIFT: <summary>. If you reconcile a \
         mismatch, commit the fix and end with DRIFT_FIXED: <summary>. If the \
         mismatch cannot be resolved, end with DRIFT_UNRESOLVABLE: <reason>.\n",
        feature.id, feature.name
    )
}

/// Read-only drift check of an already committed feature, used when drift
/// checks run side by side and must not touch the working tree.
pub fn drift_check_prompt(feature: &ScheduledFeature, commit: &str) -> String {
    format!(
        "Check feature #{} ({}) for drift between its spec and implementation as \
         committed in {commit}. Inspect it with `git show {commit}`. Do not modify \
         files, do not commit, do not check out branches.\n\n\
         If they agree, end with NO_DRIFT: <summary>. Otherwise end with \
         DRIFT_UNRESOLVABLE: <what disagrees>.\n",
        feature.id, feature.name
    )
}

pub fn review_prompt(feature: &ScheduledFeature, diff_summary: &str) -> String {
    format!(
        "Review the implementation of feature #{} ({}). Do not modify files.\n\n\
         Changed files:\n{diff_summary}\n\n\
         End with REVIEW_CLEAN: <summary> or REVIEW_FINDINGS: <findings>.\n",
        feature.id, feature.name
    )
}

/// Prompt for the sidecar's qualitative review of one commit.
pub fn eval_prompt(commit: &str, diff: &str, standards: &str, learnings: &str) -> String {
    format!(
        "You are reviewing commit {commit}. You are read-only: do not modify files, \
         do not commit, do not ask for input.\n\n\
         ## Project standards\n\n{standards}\n\n\
         ## Recent learnings\n\n{learnings}\n\n\
         ## Diff\n\n{diff}\n\n\
         Assess framework compliance (specs, tests and code consistent), scope \
         discipline, integration quality, and whether the commit repeats a \
         documented mistake. End with exactly these lines:\n\
         EVAL_COMPLETE: true\n\
         EVAL_FRAMEWORK_COMPLIANCE: <pass|warn|fail>\n\
         EVAL_SCOPE_ASSESSMENT: <focused|moderate|sprawling>\n\
         EVAL_INTEGRATION_QUALITY: <clean|minor_issues|major_issues>\n\
         EVAL_REPEATED_MISTAKES: <none|comma-separated list>\n\
         EVAL_NOTES: <one line>\n"
    )
}
