//! Outcome signaling between the agent and the orchestrator.
//!
//! The agent is instructed to end its responses with `KEY: value` lines:
//!
//! - `FEATURE_BUILT: Auth: Signup` - the build stage finished
//! - `BUILD_FAILED: missing dependency` - the build stage gave up
//! - `DRIFT_FIXED: spec updated` - the drift stage reconciled the spec
//!
//! The parser is tolerant: unknown keys are ignored, the last occurrence of a
//! key wins, and a missing key reads as an empty value. Each pipeline stage
//! declares which keys terminate it; a response with none of them fails the
//! stage, never the process.

mod parser;
mod types;

pub use parser::{SignalParser, extract_signals};
pub use types::{
    BUILD_STAGE, DRIFT_STAGE, EVAL_STAGE, REVIEW_STAGE, SignalKey, SignalValue, Signals,
    StageSignals, StageVerdict,
};
