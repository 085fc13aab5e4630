//! Per-feature state machine.
//!
//! ```text
//! Queued -> BranchSetup -> AgentInvoked -> ValidateBuild -> ValidateTest
//!        -> ValidateDrift -> ValidateReview -> Committed
//!
//! any failing stage  -> Retry -> AgentInvoked   (while retries remain)
//!                    -> Failed                  (otherwise)
//! credit exhaustion  -> Halted                  (ends the whole run)
//! ```
//!
//! `ValidateReview` is advisory: a failure there still commits.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureState {
    Queued,
    BranchSetup,
    AgentInvoked,
    ValidateBuild,
    ValidateTest,
    ValidateDrift,
    ValidateReview,
    Retry,
    Committed,
    Failed,
    Halted,
}

impl FeatureState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FeatureState::Committed | FeatureState::Failed | FeatureState::Halted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureState::Queued => "queued",
            FeatureState::BranchSetup => "branch_setup",
            FeatureState::AgentInvoked => "agent_invoked",
            FeatureState::ValidateBuild => "validate_build",
            FeatureState::ValidateTest => "validate_test",
            FeatureState::ValidateDrift => "validate_drift",
            FeatureState::ValidateReview => "validate_review",
            FeatureState::Retry => "retry",
            FeatureState::Committed => "committed",
            FeatureState::Failed => "failed",
            FeatureState::Halted => "halted",
        }
    }
}

impl std::fmt::Display for FeatureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What executing one state produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    Advance,
    /// The stage failed; the string is the output handed to the next attempt
    Fail(String),
    /// Stop the run
    Halt(String),
}

/// Next state after `current` produced `result`. `can_retry` says whether
/// the running attempt may be followed by another one.
pub fn next_state(current: FeatureState, result: &StageResult, can_retry: bool) -> FeatureState {
    use FeatureState::*;

    if current.is_terminal() {
        return current;
    }

    match result {
        StageResult::Halt(_) => Halted,
        // advisory stage: findings never block
        StageResult::Fail(_) if current == ValidateReview => Committed,
        StageResult::Fail(_) if can_retry => Retry,
        StageResult::Fail(_) => Failed,
        StageResult::Advance => match current {
            Queued => BranchSetup,
            BranchSetup => AgentInvoked,
            AgentInvoked => ValidateBuild,
            ValidateBuild => ValidateTest,
            ValidateTest => ValidateDrift,
            ValidateDrift => ValidateReview,
            ValidateReview => Committed,
            Retry => AgentInvoked,
            Committed | Failed | Halted => current,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FeatureState::*;

    fn fail() -> StageResult {
        StageResult::Fail("boom".into())
    }

    #[test]
    fn test_happy_path() {
        let mut state = Queued;
        let mut path = vec![state];
        while !state.is_terminal() {
            state = next_state(state, &StageResult::Advance, true);
            path.push(state);
        }
        assert_eq!(
            path,
            vec![
                Queued,
                BranchSetup,
                AgentInvoked,
                ValidateBuild,
                ValidateTest,
                ValidateDrift,
                ValidateReview,
                Committed
            ]
        );
    }

    #[test]
    fn test_validation_failure_retries_then_fails() {
        for stage in [AgentInvoked, ValidateBuild, ValidateTest, ValidateDrift] {
            assert_eq!(next_state(stage, &fail(), true), Retry);
            assert_eq!(next_state(stage, &fail(), false), Failed);
        }
        assert_eq!(next_state(Retry, &StageResult::Advance, true), AgentInvoked);
    }

    #[test]
    fn test_review_never_blocks() {
        assert_eq!(next_state(ValidateReview, &fail(), true), Committed);
        assert_eq!(next_state(ValidateReview, &fail(), false), Committed);
    }

    #[test]
    fn test_halt_from_any_stage() {
        let halt = StageResult::Halt("insufficient_quota".into());
        for stage in [AgentInvoked, ValidateDrift, ValidateReview] {
            assert_eq!(next_state(stage, &halt, true), Halted);
        }
    }

    #[test]
    fn test_terminal_states_stay_put() {
        for stage in [Committed, Failed, Halted] {
            assert_eq!(next_state(stage, &StageResult::Advance, true), stage);
            assert_eq!(next_state(stage, &fail(), true), stage);
        }
    }
}
