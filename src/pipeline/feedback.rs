//! Advisory feedback from the sidecar's newest evaluation.
//!
//! The sidecar runs asynchronously, so the newest record may describe a
//! feature from several steps back. Feedback only ever shapes the next
//! prompt; it never decides a stage.

use crate::sidecar::campaign::is_record_file;
use crate::sidecar::EvalRecord;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct FeedbackTracker {
    eval_dir: PathBuf,
    /// Deduplicated repeated-mistake tags seen so far this run
    mistakes: Vec<String>,
}

impl FeedbackTracker {
    pub fn new(eval_dir: impl Into<PathBuf>) -> Self {
        Self {
            eval_dir: eval_dir.into(),
            mistakes: Vec::new(),
        }
    }

    pub fn mistakes(&self) -> &[String] {
        &self.mistakes
    }

    /// Read the newest eval record and render the feedback worth passing on.
    /// `None` when there is nothing to say.
    pub fn collect(&mut self) -> Option<String> {
        let record = latest_record(&self.eval_dir).and_then(|path| match EvalRecord::load(&path) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Ignoring unreadable eval record");
                None
            }
        });

        let mut lines = Vec::new();
        if let Some(record) = &record {
            let feature = &record.mechanical.feature_name;
            if let Some(eval) = record.agent_eval.as_ref().filter(|_| record.agent_eval_available) {
                for item in eval.degraded() {
                    lines.push(format!("{feature}: {item}"));
                }
                for mistake in eval.mistakes() {
                    if !self.mistakes.contains(&mistake) {
                        self.mistakes.push(mistake);
                    }
                }
            }
            if !record.mechanical.redeclared_type_names.is_empty() {
                lines.push(format!(
                    "{feature}: redeclared existing types {}; import them instead",
                    record.mechanical.redeclared_type_names.join(", ")
                ));
            }
        }

        if lines.is_empty() && self.mistakes.is_empty() {
            return None;
        }

        let mut out = String::new();
        for line in &lines {
            let _ = writeln!(out, "- {line}");
        }
        if !self.mistakes.is_empty() {
            let _ = writeln!(out, "Repeated mistakes this run, avoid them:");
            for mistake in &self.mistakes {
                let _ = writeln!(out, "- {mistake}");
            }
        }
        Some(out)
    }
}

/// Most recently modified per-feature record in `dir`.
fn latest_record(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| is_record_file(&entry.path()))
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.path()))
        })
        .max_by_key(|(modified, path)| (*modified, path.clone()))
        .map(|(_, path)| path)
}
