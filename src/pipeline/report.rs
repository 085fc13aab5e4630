//! End-of-run report: a console table and `logs/build-summary-<ts>.json`.

use crate::sidecar::write_json_atomic;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Built,
    Failed,
    /// Already completed by an earlier run
    Skipped,
    /// Never started because the run halted
    NotAttempted,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Built => "built",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
            Outcome::NotAttempted => "not_attempted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureReport {
    pub id: u32,
    pub name: String,
    pub outcome: Outcome,
    pub attempts: u32,
    pub duration_secs: f64,
    pub branch: Option<String>,
    /// Non-blocking findings (advisory checks, review, drift in parallel mode)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub built: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub features: Vec<FeatureReport>,
    pub totals: Totals,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            halted: false,
            halt_reason: None,
            features: Vec::new(),
            totals: Totals::default(),
        }
    }

    pub fn push(&mut self, feature: FeatureReport) {
        match feature.outcome {
            Outcome::Built => self.totals.built += 1,
            Outcome::Failed => self.totals.failed += 1,
            Outcome::Skipped | Outcome::NotAttempted => self.totals.skipped += 1,
        }
        self.features.push(feature);
    }

    pub fn halt(&mut self, reason: impl Into<String>) {
        self.halted = true;
        self.halt_reason = Some(reason.into());
    }

    pub fn feature_mut(&mut self, id: u32) -> Option<&mut FeatureReport> {
        self.features.iter_mut().find(|f| f.id == id)
    }

    /// Whether every attempted feature was built and the run did not halt.
    pub fn is_success(&self) -> bool {
        !self.halted && self.totals.failed == 0
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Write `build-summary-<YYYYmmdd-HHMMSS>.json` into `log_dir`.
    pub fn write(&self, log_dir: &Path) -> Result<PathBuf> {
        let stamp = self
            .finished_at
            .unwrap_or_else(Utc::now)
            .format("%Y%m%d-%H%M%S");
        let path = log_dir.join(format!("build-summary-{stamp}.json"));
        write_json_atomic(&path, self)?;
        Ok(path)
    }

    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<5} {:<36} {:<14} {:>8} {:>10}",
            "ID", "Feature", "Outcome", "Attempts", "Duration"
        );
        let _ = writeln!(out, "{}", "-".repeat(77));
        for f in &self.features {
            let outcome = match f.outcome {
                Outcome::Built => console::style(f.outcome.as_str()).green(),
                Outcome::Failed => console::style(f.outcome.as_str()).red(),
                Outcome::Skipped | Outcome::NotAttempted => console::style(f.outcome.as_str()).dim(),
            };
            let _ = writeln!(
                out,
                "{:<5} {:<36} {:<14} {:>8} {:>9.0}s",
                f.id,
                truncate(&f.name, 36),
                outcome,
                f.attempts,
                f.duration_secs
            );
        }
        let _ = writeln!(out, "{}", "-".repeat(77));
        let _ = write!(
            out,
            "built: {}  failed: {}  skipped: {}",
            self.totals.built, self.totals.failed, self.totals.skipped
        );
        if let Some(reason) = &self.halt_reason {
            let _ = write!(out, "\n{} {reason}", console::style("Halted:").red().bold());
        }
        out
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max - 1).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn feature(id: u32, outcome: Outcome) -> FeatureReport {
        FeatureReport {
            id,
            name: format!("Feature {id}"),
            outcome,
            attempts: 1,
            duration_secs: 12.5,
            branch: Some(format!("auto/feature-{id}")),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_totals_and_success() {
        let mut report = RunReport::new();
        report.push(feature(1, Outcome::Built));
        report.push(feature(2, Outcome::Skipped));
        assert!(report.is_success());
        report.push(feature(3, Outcome::Failed));
        assert_eq!(
            report.totals,
            Totals {
                built: 1,
                failed: 1,
                skipped: 1
            }
        );
        assert!(!report.is_success());
    }

    #[test]
    fn test_write_machine_readable_summary() {
        let dir = tempdir().unwrap();
        let mut report = RunReport::new();
        report.push(feature(1, Outcome::Built));
        report.push(feature(2, Outcome::NotAttempted));
        report.halt("API credits exhausted (matched 'insufficient_quota')");
        report.finish();

        let path = report.write(dir.path()).unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("build-summary-") && name.ends_with(".json"));

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["halted"], true);
        assert_eq!(value["features"][0]["outcome"], "built");
        assert_eq!(value["features"][1]["outcome"], "not_attempted");
        assert_eq!(value["totals"]["skipped"], 1);
        assert!(value["started_at"].is_string());
    }

    #[test]
    fn test_table_lists_features_and_halt() {
        let mut report = RunReport::new();
        report.push(feature(7, Outcome::Built));
        report.halt("cycle");
        let table = report.render_table();
        assert!(table.contains("Feature 7"));
        assert!(table.contains("built: 1"));
        assert!(table.contains("cycle"));
        assert_eq!(truncate("abcdef", 4), "abc…");
    }
}
