//! On-disk evaluation records.

use crate::signals::{SignalKey, Signals};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static UNSAFE_CHARS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9._-]").unwrap());
static DASH_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").unwrap());

/// Agent-free measurements of one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MechanicalEval {
    pub commit: String,
    pub feature_name: String,
    pub files_changed: usize,
    pub files: Vec<String>,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub new_type_exports: usize,
    pub type_redeclarations: usize,
    pub redeclared_type_names: Vec<String>,
    pub import_count: usize,
    pub test_files_touched: bool,
}

/// Qualitative judgment returned by an eval agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEval {
    /// pass | warn | fail
    pub framework_compliance: String,
    /// focused | moderate | sprawling
    pub scope_assessment: String,
    /// clean | minor_issues | major_issues
    pub integration_quality: String,
    /// "none" or a comma-separated list
    pub repeated_mistakes: String,
    pub eval_notes: String,
}

impl AgentEval {
    /// The judgment carried by `signals`, present only when the agent
    /// reported `EVAL_COMPLETE: true`.
    pub fn from_signals(signals: &Signals) -> Option<Self> {
        if signals.get(SignalKey::EvalComplete) != "true" {
            return None;
        }
        Some(Self {
            framework_compliance: signals.get(SignalKey::EvalFrameworkCompliance).to_string(),
            scope_assessment: signals.get(SignalKey::EvalScopeAssessment).to_string(),
            integration_quality: signals.get(SignalKey::EvalIntegrationQuality).to_string(),
            repeated_mistakes: signals.get(SignalKey::EvalRepeatedMistakes).to_string(),
            eval_notes: signals.get(SignalKey::EvalNotes).to_string(),
        })
    }

    /// Individual repeated-mistake tags, with "none" and blanks dropped.
    pub fn mistakes(&self) -> Vec<String> {
        self.repeated_mistakes
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty() && !m.eq_ignore_ascii_case("none"))
            .map(str::to_string)
            .collect()
    }

    /// Human-readable descriptions of every dimension that came back worse
    /// than its best rating.
    pub fn degraded(&self) -> Vec<String> {
        let mut out = Vec::new();
        if matches!(self.framework_compliance.as_str(), "warn" | "fail") {
            out.push(format!("framework compliance: {}", self.framework_compliance));
        }
        if self.scope_assessment == "sprawling" {
            out.push("scope: sprawling".to_string());
        }
        if matches!(
            self.integration_quality.as_str(),
            "minor_issues" | "major_issues"
        ) {
            out.push(format!("integration quality: {}", self.integration_quality));
        }
        out
    }
}

/// Contents of `eval-<feature>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalRecord {
    pub eval_timestamp: String,
    pub mechanical: MechanicalEval,
    pub agent_eval_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_eval: Option<AgentEval>,
}

impl EvalRecord {
    pub fn new(mechanical: MechanicalEval, agent_eval: Option<AgentEval>) -> Self {
        Self {
            eval_timestamp: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            mechanical,
            agent_eval_available: agent_eval.is_some(),
            agent_eval,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read eval result: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse eval result: {}", path.display()))
    }

    /// Write the record into `dir`, named after its feature. Returns the path.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let mut name = sanitize_name(&self.mechanical.feature_name);
        if name.is_empty() {
            name = self.mechanical.commit.chars().take(8).collect();
        }
        let path = dir.join(format!("eval-{name}.json"));
        write_json_atomic(&path, self)?;
        Ok(path)
    }
}

/// File-name-safe form of a feature name: lowercase, anything outside
/// `[a-z0-9._-]` replaced by `-`, dash runs collapsed, ends trimmed.
pub fn sanitize_name(name: &str) -> String {
    let lower = name.to_lowercase();
    let replaced = UNSAFE_CHARS_RE.replace_all(&lower, "-");
    let collapsed = DASH_RUN_RE.replace_all(&replaced, "-");
    collapsed.trim_matches('-').to_string()
}

/// Serialize `value` as pretty JSON next to `path` and rename it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .context("Output path has no parent directory")?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    let mut data = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    data.push('\n');

    let mut tmp = tempfile::Builder::new()
        .prefix(".eval-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .context("Failed to create temp file")?;
    tmp.write_all(data.as_bytes())
        .context("Failed to write temp file")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move result into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::extract_signals;
    use tempfile::tempdir;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("Auth: Signup Flow"), "auth-signup-flow");
        assert_eq!(sanitize_name("--Weird__Name!!v2.0--"), "weird__name-v2.0");
        assert_eq!(sanitize_name("???"), "");
    }

    #[test]
    fn test_agent_eval_requires_complete_true() {
        let partial = extract_signals("EVAL_FRAMEWORK_COMPLIANCE: pass\nEVAL_COMPLETE: false\n");
        assert!(AgentEval::from_signals(&partial).is_none());

        let full = extract_signals(
            "EVAL_COMPLETE: true\n\
             EVAL_FRAMEWORK_COMPLIANCE: warn\n\
             EVAL_SCOPE_ASSESSMENT: sprawling\n\
             EVAL_INTEGRATION_QUALITY: clean\n\
             EVAL_REPEATED_MISTAKES: none\n\
             EVAL_NOTES: touches three unrelated modules\n",
        );
        let eval = AgentEval::from_signals(&full).unwrap();
        assert_eq!(eval.framework_compliance, "warn");
        assert_eq!(eval.eval_notes, "touches three unrelated modules");
        assert!(eval.mistakes().is_empty());
        assert_eq!(
            eval.degraded(),
            vec!["framework compliance: warn", "scope: sprawling"]
        );
    }

    #[test]
    fn test_mistakes_split() {
        let eval = AgentEval {
            repeated_mistakes: "duplicate types, ,missing tests".into(),
            ..Default::default()
        };
        assert_eq!(eval.mistakes(), vec!["duplicate types", "missing tests"]);
    }

    #[test]
    fn test_write_omits_missing_agent_eval() {
        let dir = tempdir().unwrap();
        let record = EvalRecord::new(
            MechanicalEval {
                commit: "abcdef1234".into(),
                feature_name: "User Login".into(),
                files_changed: 2,
                ..Default::default()
            },
            None,
        );
        let path = record.write(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("eval-user-login.json"));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("agent_eval\""));
        assert!(raw.contains("\"agent_eval_available\": false"));
        assert_eq!(EvalRecord::load(&path).unwrap(), record);
    }

    #[test]
    fn test_unnamed_feature_falls_back_to_commit() {
        let dir = tempdir().unwrap();
        let record = EvalRecord::new(
            MechanicalEval {
                commit: "0123456789abcdef".into(),
                feature_name: "!!!".into(),
                ..Default::default()
            },
            None,
        );
        assert_eq!(
            record.write(dir.path()).unwrap(),
            dir.path().join("eval-01234567.json")
        );
    }
}
