//! The build pipeline: one agent-driven build per scheduled feature.
//!
//! Each feature moves through the [`FeatureState`] machine. Mechanical
//! validation (build, test) decides whether a stage passed; agent signals
//! only say what the agent claims. Resume state is written after every
//! committed feature.

mod feedback;
mod orchestrator;
mod report;
mod stage;
mod validate;

pub use feedback::FeedbackTracker;
pub use orchestrator::Orchestrator;
pub use report::{FeatureReport, Outcome, RunReport, Totals};
pub use stage::{FeatureState, StageResult, next_state};
pub use validate::{
    DriftCheck, DriftHalt, DriftJob, DriftRound, TestCountTracker, Validator, drift_workers, parallel_drift,
    parse_test_count,
};
