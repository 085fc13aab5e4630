//! Campaign-level aggregation of every eval record in the eval directory.

use super::result::{EvalRecord, write_json_atomic};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CAMPAIGN_PREFIX: &str = "eval-campaign-";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceCounts {
    pub pass: usize,
    pub warn: usize,
    pub fail: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeCounts {
    pub focused: usize,
    pub moderate: usize,
    pub sprawling: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationCounts {
    pub clean: usize,
    pub minor_issues: usize,
    pub major_issues: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub campaign_timestamp: String,
    pub total_features_evaluated: usize,
    pub type_redeclarations_total: usize,
    pub framework_compliance: ComplianceCounts,
    pub scope_assessment: ScopeCounts,
    pub integration_quality: IntegrationCounts,
    pub features_with_issues_count: usize,
    pub features_with_issues: Vec<String>,
}

impl CampaignSummary {
    /// Tally `records`. A feature has issues when it redeclared a type or
    /// its agent judgment rated compliance warn/fail, scope sprawling, or
    /// integration major_issues.
    pub fn from_records(records: &[EvalRecord]) -> Self {
        let mut summary = Self {
            campaign_timestamp: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            total_features_evaluated: records.len(),
            ..Default::default()
        };

        for record in records {
            let redeclared = record.mechanical.type_redeclarations;
            summary.type_redeclarations_total += redeclared;
            let mut has_issue = redeclared > 0;

            if let Some(eval) = record.agent_eval.as_ref().filter(|_| record.agent_eval_available) {
                match eval.framework_compliance.as_str() {
                    "pass" => summary.framework_compliance.pass += 1,
                    "warn" => {
                        summary.framework_compliance.warn += 1;
                        has_issue = true;
                    }
                    "fail" => {
                        summary.framework_compliance.fail += 1;
                        has_issue = true;
                    }
                    _ => {}
                }
                match eval.scope_assessment.as_str() {
                    "focused" => summary.scope_assessment.focused += 1,
                    "moderate" => summary.scope_assessment.moderate += 1,
                    "sprawling" => {
                        summary.scope_assessment.sprawling += 1;
                        has_issue = true;
                    }
                    _ => {}
                }
                match eval.integration_quality.as_str() {
                    "clean" => summary.integration_quality.clean += 1,
                    "minor_issues" => summary.integration_quality.minor_issues += 1,
                    "major_issues" => {
                        summary.integration_quality.major_issues += 1;
                        has_issue = true;
                    }
                    _ => {}
                }
            }

            if has_issue {
                let name = match record.mechanical.feature_name.as_str() {
                    "" => "unknown".to_string(),
                    name => name.to_string(),
                };
                summary.features_with_issues.push(name);
            }
        }

        summary.features_with_issues_count = summary.features_with_issues.len();
        summary
    }

    /// Write `eval-campaign-<YYYYmmdd-HHMMSS>.json` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("{CAMPAIGN_PREFIX}{stamp}.json"));
        write_json_atomic(&path, self)?;
        Ok(path)
    }

    pub fn render(&self) -> String {
        let rule = "=".repeat(48);
        let thin = "-".repeat(48);
        let mut out = String::new();
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "         EVAL CAMPAIGN SUMMARY");
        let _ = writeln!(out, "{rule}");
        let _ = writeln!(out, "Total features evaluated: {}", self.total_features_evaluated);
        let _ = writeln!(out, "Type redeclarations:      {}", self.type_redeclarations_total);
        let _ = writeln!(out, "{thin}");
        let fc = &self.framework_compliance;
        let _ = writeln!(
            out,
            "Framework Compliance: pass={}  warn={}  fail={}",
            fc.pass, fc.warn, fc.fail
        );
        let sc = &self.scope_assessment;
        let _ = writeln!(
            out,
            "Scope Assessment: focused={}  moderate={}  sprawling={}",
            sc.focused, sc.moderate, sc.sprawling
        );
        let iq = &self.integration_quality;
        let _ = writeln!(
            out,
            "Integration Quality: clean={}  minor={}  major={}",
            iq.clean, iq.minor_issues, iq.major_issues
        );
        let _ = writeln!(out, "{thin}");
        let _ = writeln!(out, "Features with issues: {}", self.features_with_issues_count);
        for name in &self.features_with_issues {
            let _ = writeln!(out, "  - {name}");
        }
        let _ = write!(out, "{rule}");
        out
    }
}

/// Every per-feature record in `dir`, sorted by file name. Unreadable files
/// are skipped with a warning.
pub fn load_records(dir: &Path) -> Result<Vec<EvalRecord>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read eval directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_record_file(p))
        .collect();
    paths.sort();

    let mut records = Vec::new();
    for path in paths {
        match EvalRecord::load(&path) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "Could not parse eval file"),
        }
    }
    Ok(records)
}

/// Whether `path` names a per-feature eval record (not a campaign file).
pub fn is_record_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| {
            n.starts_with("eval-") && n.ends_with(".json") && !n.starts_with(CAMPAIGN_PREFIX)
        })
}

/// Aggregate, write and log the campaign summary for `dir`. `None` when
/// nothing has been evaluated.
pub fn generate(dir: &Path) -> Result<Option<(CampaignSummary, PathBuf)>> {
    let records = load_records(dir)?;
    if records.is_empty() {
        info!("No eval results to summarize");
        return Ok(None);
    }
    let summary = CampaignSummary::from_records(&records);
    let path = summary.write(dir)?;
    for line in summary.render().lines() {
        info!("{line}");
    }
    info!(path = %path.display(), "Campaign summary written");
    Ok(Some((summary, path)))
}
