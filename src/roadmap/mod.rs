//! Feature roadmap: the ordered table of features a campaign builds.
//!
//! The on-disk source is a markdown table in `.specs/roadmap.md`:
//!
//! ```text
//! | # | Feature | Source | Jira | Complexity | Deps | Status |
//! |---|---------|--------|------|------------|------|--------|
//! | 1 | Auth: Signup | spec | - | M | - | ✅ |
//! | 2 | Dashboard | spec | - | L | 1 | ⬜ |
//! ```
//!
//! Only the id, name, complexity, deps and status columns matter to the
//! engine; everything else in the file is ignored.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

static ROW_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\|\s*(\d+)\s*\|").unwrap());

/// Complexity tier of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Small,
    #[default]
    Medium,
    Large,
}

impl Complexity {
    /// Parse the roadmap's loose complexity column (`S`, `medium`, `L`, ...).
    pub fn parse(raw: &str) -> Complexity {
        match raw.trim().to_lowercase().chars().next() {
            Some('s') => Complexity::Small,
            Some('l') => Complexity::Large,
            _ => Complexity::Medium,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Small => write!(f, "small"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::Large => write!(f, "large"),
        }
    }
}

/// Lifecycle status of a roadmap row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Pending,
    InProgress,
    Done,
    Blocked,
}

impl FeatureStatus {
    /// Decode the status column emoji.
    pub fn parse(raw: &str) -> FeatureStatus {
        if raw.contains('\u{2705}') {
            FeatureStatus::Done
        } else if raw.contains('\u{2b1c}') {
            FeatureStatus::Pending
        } else if raw.contains('\u{1f504}') {
            FeatureStatus::InProgress
        } else {
            FeatureStatus::Blocked
        }
    }
}

/// One row of the roadmap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub id: u32,
    pub name: String,
    pub complexity: Complexity,
    pub deps: BTreeSet<u32>,
    pub status: FeatureStatus,
}

impl FeatureSpec {
    pub fn new(
        id: u32,
        name: impl Into<String>,
        complexity: Complexity,
        deps: impl IntoIterator<Item = u32>,
        status: FeatureStatus,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            complexity,
            deps: deps.into_iter().collect(),
            status,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == FeatureStatus::Pending
    }

    pub fn is_done(&self) -> bool {
        self.status == FeatureStatus::Done
    }
}

/// Parse the deps column: `-` or empty means none, otherwise the digits of
/// each comma-separated entry form an id (`#3`, `F-4` and `5` all work).
pub fn parse_deps(raw: &str) -> BTreeSet<u32> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "-" {
        return BTreeSet::new();
    }
    raw.split(',')
        .filter_map(|part| {
            let digits: String = part.chars().filter(char::is_ascii_digit).collect();
            digits.parse().ok()
        })
        .collect()
}

/// Parse roadmap markdown into feature rows, in table order.
pub fn parse_roadmap(content: &str) -> Vec<FeatureSpec> {
    content
        .lines()
        .filter(|line| ROW_REGEX.is_match(line))
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('|').map(str::trim).collect();
            // ['', id, name, source, ticket, complexity, deps, status, '']
            if cols.len() < 9 {
                return None;
            }
            Some(FeatureSpec {
                id: cols[1].parse().ok()?,
                name: cols[2].to_string(),
                complexity: Complexity::parse(cols[5]),
                deps: parse_deps(cols[6]),
                status: FeatureStatus::parse(cols[7]),
            })
        })
        .collect()
}

/// Load the roadmap file. A missing file is an empty roadmap.
pub fn load_roadmap(path: &Path) -> Result<Vec<FeatureSpec>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read roadmap: {}", path.display()))?;
    Ok(parse_roadmap(&content))
}
