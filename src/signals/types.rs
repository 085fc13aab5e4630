//! Signal vocabulary and per-stage terminal signal sets.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Every key the orchestrator recognizes in agent output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKey {
    FeatureBuilt,
    BuildFailed,
    NoFeaturesReady,
    SpecFile,
    SourceFiles,
    NoDrift,
    DriftFixed,
    DriftUnresolvable,
    ReviewClean,
    ReviewFindings,
    EvalComplete,
    EvalFrameworkCompliance,
    EvalScopeAssessment,
    EvalIntegrationQuality,
    EvalRepeatedMistakes,
    EvalNotes,
}

impl SignalKey {
    pub const ALL: [SignalKey; 16] = [
        SignalKey::FeatureBuilt,
        SignalKey::BuildFailed,
        SignalKey::NoFeaturesReady,
        SignalKey::SpecFile,
        SignalKey::SourceFiles,
        SignalKey::NoDrift,
        SignalKey::DriftFixed,
        SignalKey::DriftUnresolvable,
        SignalKey::ReviewClean,
        SignalKey::ReviewFindings,
        SignalKey::EvalComplete,
        SignalKey::EvalFrameworkCompliance,
        SignalKey::EvalScopeAssessment,
        SignalKey::EvalIntegrationQuality,
        SignalKey::EvalRepeatedMistakes,
        SignalKey::EvalNotes,
    ];

    /// The literal key as it appears in agent output.
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKey::FeatureBuilt => "FEATURE_BUILT",
            SignalKey::BuildFailed => "BUILD_FAILED",
            SignalKey::NoFeaturesReady => "NO_FEATURES_READY",
            SignalKey::SpecFile => "SPEC_FILE",
            SignalKey::SourceFiles => "SOURCE_FILES",
            SignalKey::NoDrift => "NO_DRIFT",
            SignalKey::DriftFixed => "DRIFT_FIXED",
            SignalKey::DriftUnresolvable => "DRIFT_UNRESOLVABLE",
            SignalKey::ReviewClean => "REVIEW_CLEAN",
            SignalKey::ReviewFindings => "REVIEW_FINDINGS",
            SignalKey::EvalComplete => "EVAL_COMPLETE",
            SignalKey::EvalFrameworkCompliance => "EVAL_FRAMEWORK_COMPLIANCE",
            SignalKey::EvalScopeAssessment => "EVAL_SCOPE_ASSESSMENT",
            SignalKey::EvalIntegrationQuality => "EVAL_INTEGRATION_QUALITY",
            SignalKey::EvalRepeatedMistakes => "EVAL_REPEATED_MISTAKES",
            SignalKey::EvalNotes => "EVAL_NOTES",
        }
    }

    /// Look up a key by its literal spelling.
    pub fn from_key(key: &str) -> Option<SignalKey> {
        SignalKey::ALL.into_iter().find(|k| k.as_str() == key)
    }
}

impl std::fmt::Display for SignalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The last value seen for a key, and the line it was seen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalValue {
    pub value: String,
    pub line: usize,
}

/// Signals decoded from one agent response.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    values: HashMap<SignalKey, SignalValue>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, key: SignalKey, value: impl Into<String>, line: usize) {
        self.values.insert(
            key,
            SignalValue {
                value: value.into(),
                line,
            },
        );
    }

    /// Value for `key`, or the empty string when the agent never emitted it.
    pub fn get(&self, key: SignalKey) -> &str {
        self.values.get(&key).map_or("", |v| v.value.as_str())
    }

    pub fn contains(&self, key: SignalKey) -> bool {
        self.values.contains_key(&key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Among `keys`, the one emitted last in the response.
    fn latest_of(&self, keys: &[SignalKey]) -> Option<(SignalKey, &SignalValue)> {
        keys.iter()
            .filter_map(|k| self.values.get(k).map(|v| (*k, v)))
            .max_by_key(|(_, v)| v.line)
    }
}

/// Terminal signals a pipeline stage accepts.
#[derive(Debug, Clone, Copy)]
pub struct StageSignals {
    pub stage: &'static str,
    pub success: &'static [SignalKey],
    pub failure: &'static [SignalKey],
}

/// How a stage resolved from one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageVerdict {
    Passed { signal: SignalKey, value: String },
    Failed { signal: SignalKey, reason: String },
    /// None of the stage's terminal signals appeared.
    NoSignal,
}

impl StageVerdict {
    pub fn is_passed(&self) -> bool {
        matches!(self, StageVerdict::Passed { .. })
    }
}

impl StageSignals {
    /// Resolve the stage. When both a success and a failure key appear, the
    /// one emitted last decides.
    pub fn evaluate(&self, signals: &Signals) -> StageVerdict {
        let all: Vec<SignalKey> = self
            .success
            .iter()
            .chain(self.failure.iter())
            .copied()
            .collect();

        match signals.latest_of(&all) {
            Some((signal, v)) if self.success.contains(&signal) => StageVerdict::Passed {
                signal,
                value: v.value.clone(),
            },
            Some((signal, v)) => StageVerdict::Failed {
                signal,
                reason: v.value.clone(),
            },
            None => StageVerdict::NoSignal,
        }
    }
}

pub const BUILD_STAGE: StageSignals = StageSignals {
    stage: "build",
    success: &[SignalKey::FeatureBuilt],
    failure: &[SignalKey::BuildFailed, SignalKey::NoFeaturesReady],
};

pub const DRIFT_STAGE: StageSignals = StageSignals {
    stage: "drift",
    success: &[SignalKey::NoDrift, SignalKey::DriftFixed],
    failure: &[SignalKey::DriftUnresolvable],
};

pub const REVIEW_STAGE: StageSignals = StageSignals {
    stage: "review",
    success: &[SignalKey::ReviewClean],
    failure: &[SignalKey::ReviewFindings],
};

pub const EVAL_STAGE: StageSignals = StageSignals {
    stage: "eval",
    success: &[SignalKey::EvalComplete],
    failure: &[],
};
