//! Typed error hierarchy for the autosdd orchestrator.
//!
//! Two top-level enums cover the two processes:
//! - `OrchestratorError`: run-fatal failures of the primary build loop
//! - `SidecarError`: failures of the background evaluator
//!
//! Feature-level failures (build, test, drift) never appear here: the
//! pipeline resolves them locally into a retry or a failed feature.

use std::path::PathBuf;
use thiserror::Error;

/// Process exit status for any failure without a dedicated code.
pub const EXIT_FAILURE: i32 = 1;
/// Process exit status when the roadmap dependency graph has a cycle.
pub const EXIT_CIRCULAR_DEPENDENCY: i32 = 2;
/// Process exit status when another orchestrator holds the project lock.
pub const EXIT_LOCK_CONTENTION: i32 = 3;

/// Errors that halt an orchestrator run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Circular dependency detected in roadmap: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    #[error("Another instance is already running (PID: {pid}). Lock file: {}", .path.display())]
    LockContention { pid: u32, path: PathBuf },

    #[error("API credits exhausted (matched '{matched}') - halting run")]
    CreditExhausted { matched: String },

    #[error("State file at {} is corrupt: {source}", .path.display())]
    StateCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to spawn agent process: {0}")]
    AgentSpawn(#[source] std::io::Error),

    #[error("Agent exceeded {secs}s timeout")]
    AgentTimeout { secs: u64 },
}

impl OrchestratorError {
    /// Map the error to the process exit status the CLI reports.
    pub fn exit_code(&self) -> i32 {
        match self {
            OrchestratorError::CircularDependency { .. } => EXIT_CIRCULAR_DEPENDENCY,
            OrchestratorError::LockContention { .. } => EXIT_LOCK_CONTENTION,
            _ => EXIT_FAILURE,
        }
    }
}

/// Errors from the background evaluation sidecar.
#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("Could not determine HEAD commit in {}", .0.display())]
    NoHead(PathBuf),
}

/// Walk an `anyhow` chain and return the exit code of the first typed
/// orchestrator error, or [`EXIT_FAILURE`].
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<OrchestratorError>())
        .map_or(EXIT_FAILURE, OrchestratorError::exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_dependency_formats_cycle_path() {
        let err = OrchestratorError::CircularDependency {
            cycle: vec!["2".into(), "4".into(), "3".into(), "2".into()],
        };
        assert!(err.to_string().contains("2 -> 4 -> 3 -> 2"));
        assert_eq!(err.exit_code(), EXIT_CIRCULAR_DEPENDENCY);
    }

    #[test]
    fn lock_contention_carries_pid_and_code() {
        let err = OrchestratorError::LockContention {
            pid: 4242,
            path: PathBuf::from("/tmp/build.lock"),
        };
        assert!(err.to_string().contains("4242"));
        assert_eq!(err.exit_code(), EXIT_LOCK_CONTENTION);
    }

    #[test]
    fn credit_exhaustion_is_general_failure() {
        let err = OrchestratorError::CreditExhausted {
            matched: "insufficient_quota".into(),
        };
        assert!(err.to_string().contains("insufficient_quota"));
        assert_eq!(err.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn exit_code_for_finds_typed_error_through_context() {
        let err = anyhow::Error::new(OrchestratorError::CircularDependency {
            cycle: vec!["1".into(), "1".into()],
        })
        .context("Scheduling roadmap");
        assert_eq!(exit_code_for(&err), EXIT_CIRCULAR_DEPENDENCY);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&plain), EXIT_FAILURE);
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::AgentTimeout { secs: 1 });
        assert_std_error(&SidecarError::NoHead(PathBuf::from("/tmp/repo")));
    }
}
