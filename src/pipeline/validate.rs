//! Mechanical validation: build, test, advisory checks, and the optional
//! side-by-side drift pass.

use crate::agent::{Agent, AgentRequest};
use crate::config::Config;
use crate::dag::ScheduledFeature;
use crate::exec::{CommandOutcome, run_command};
use crate::project_config::CommandSpec;
use crate::prompt::drift_check_prompt;
use crate::retry::BackoffController;
use crate::signals::{DRIFT_STAGE, StageVerdict};
use anyhow::Result;
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

static TEST_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s+(?:passed|tests|passing)").unwrap());

/// Runs the configured build, test and advisory commands in the project.
pub struct Validator<'a> {
    config: &'a Config,
}

impl<'a> Validator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    async fn run(&self, spec: Option<&CommandSpec>) -> Result<CommandOutcome> {
        match spec {
            Some(spec) => {
                run_command(spec, &self.config.project_dir, self.config.command_timeout()).await
            }
            None => Ok(CommandOutcome::skipped()),
        }
    }

    pub async fn build(&self) -> Result<CommandOutcome> {
        self.run(self.config.validation.build.as_ref()).await
    }

    pub async fn test(&self) -> Result<CommandOutcome> {
        self.run(self.config.validation.test.as_ref()).await
    }

    /// Run every advisory check. Failures are logged and returned by name;
    /// they never fail a feature.
    pub async fn advisory(&self) -> Vec<String> {
        let mut failed = Vec::new();
        for check in &self.config.validation.advisory {
            match self.run(Some(&check.command)).await {
                Ok(outcome) if outcome.success => {}
                Ok(outcome) => {
                    warn!(check = %check.name, exit_code = ?outcome.exit_code, "Advisory check failed (non-blocking)");
                    failed.push(check.name.clone());
                }
                Err(e) => {
                    warn!(check = %check.name, error = %e, "Advisory check could not run (non-blocking)");
                    failed.push(check.name.clone());
                }
            }
        }
        failed
    }
}

/// Test count reported by a test runner: the first number directly
/// followed by `passed`, `tests` or `passing`.
pub fn parse_test_count(output: &str) -> Option<u64> {
    TEST_COUNT_RE
        .captures(output)
        .and_then(|caps| caps[1].parse().ok())
}

/// Tracks the test count across features and warns when it drops.
#[derive(Debug, Default)]
pub struct TestCountTracker {
    previous: Option<u64>,
}

impl TestCountTracker {
    /// Record a passing test run. Returns `(previous, current)` when the
    /// count went down.
    pub fn observe(&mut self, output: &str) -> Option<(u64, u64)> {
        let current = parse_test_count(output)?;
        let regression = self
            .previous
            .filter(|&previous| current < previous)
            .map(|previous| (previous, current));
        if let Some((previous, current)) = regression {
            warn!(previous, current, "Test count regressed (non-blocking)");
        }
        self.previous = Some(current);
        regression
    }
}

/// One committed feature to drift-check.
#[derive(Debug, Clone)]
pub struct DriftJob {
    pub feature: ScheduledFeature,
    pub commit: String,
}

/// Result of one drift check.
#[derive(Debug, Clone)]
pub struct DriftCheck {
    pub feature: ScheduledFeature,
    pub passed: bool,
    pub detail: String,
}

/// Why a parallel drift round stopped the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftHalt {
    CreditExhausted(String),
    Interrupted,
}

/// Every check of a parallel round, in job order, plus any run-fatal stop.
#[derive(Debug, Clone)]
pub struct DriftRound {
    pub checks: Vec<DriftCheck>,
    pub halt: Option<DriftHalt>,
}

/// Default worker count: available CPUs, capped by the number of jobs.
pub fn drift_workers(jobs: usize) -> usize {
    let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
    cpus.min(jobs).max(1)
}

/// Drift-check `jobs` concurrently with at most `workers` agents in flight.
///
/// Each call goes through `backoff`, so rate limits are retried and credit
/// exhaustion is detected. A credit match stops the jobs still running and
/// is reported in [`DriftRound::halt`], as is a cancel of `cancel`. All
/// checks are joined before returning; a check that errors, panics or is
/// stopped counts as failed.
pub async fn parallel_drift(
    agent: Arc<dyn Agent>,
    jobs: Vec<DriftJob>,
    cwd: PathBuf,
    model: Option<String>,
    workers: usize,
    backoff: BackoffController,
    cancel: CancellationToken,
) -> DriftRound {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let stop = cancel.child_token();
    let mut set = JoinSet::new();
    info!(jobs = jobs.len(), workers, "Running drift checks in parallel");

    for (index, job) in jobs.iter().cloned().enumerate() {
        let agent = agent.clone();
        let semaphore = semaphore.clone();
        let backoff = backoff.clone();
        let stop = stop.clone();
        let request = AgentRequest::new(drift_check_prompt(&job.feature, &job.commit), cwd.clone())
            .with_model(model.clone());
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            if stop.is_cancelled() {
                return (index, None);
            }
            let result = tokio::select! {
                outcome = backoff.invoke(agent.as_ref(), &request) => Some(outcome),
                _ = stop.cancelled() => None,
            };
            // stop queued jobs before this permit frees up
            if matches!(&result, Some(Ok(outcome)) if outcome.credit_exhausted.is_some()) {
                stop.cancel();
            }
            (index, result)
        });
    }

    let mut halt = None;
    let mut checks: Vec<Option<DriftCheck>> = vec![None; jobs.len()];
    while let Some(joined) = set.join_next().await {
        let (index, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                warn!(error = %e, "Drift task panicked");
                continue;
            }
        };
        let feature = jobs[index].feature.clone();
        let failed = |detail: String| DriftCheck {
            feature: feature.clone(),
            passed: false,
            detail,
        };
        let check = match result {
            None => failed("drift check interrupted".to_string()),
            Some(Err(e)) => failed(format!("drift check failed: {e}")),
            Some(Ok(outcome)) => {
                if let Some(matched) = outcome.credit_exhausted {
                    warn!(id = feature.id, matched = %matched, "Credit exhaustion during drift checks");
                    halt = Some(DriftHalt::CreditExhausted(matched));
                    failed("drift check stopped: credits exhausted".to_string())
                } else if outcome.exhausted {
                    failed(format!(
                        "drift check still rate limited after {} retries",
                        outcome.retries()
                    ))
                } else {
                    match DRIFT_STAGE.evaluate(&outcome.output.signals()) {
                        StageVerdict::Passed { value, .. } => DriftCheck {
                            feature: feature.clone(),
                            passed: true,
                            detail: value,
                        },
                        StageVerdict::Failed { reason, .. } => failed(reason),
                        StageVerdict::NoSignal => {
                            failed("no drift signal in agent output".to_string())
                        }
                    }
                }
            }
        };
        checks[index] = Some(check);
    }

    if halt.is_none() && cancel.is_cancelled() {
        halt = Some(DriftHalt::Interrupted);
    }

    let checks = checks
        .into_iter()
        .zip(jobs)
        .map(|(check, job)| {
            check.unwrap_or(DriftCheck {
                feature: job.feature,
                passed: false,
                detail: "drift task did not complete".to_string(),
            })
        })
        .collect();
    DriftRound { checks, halt }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedAgent;
    use crate::project_config::{AdvisoryCheck, SddToml};
    use crate::roadmap::Complexity;
    use std::time::Duration;
    use tempfile::tempdir;

    fn feature(id: u32) -> ScheduledFeature {
        ScheduledFeature {
            id,
            name: format!("Feature {id}"),
            complexity: Complexity::Small,
        }
    }

    #[test]
    fn test_parse_test_count() {
        assert_eq!(parse_test_count("Tests: 2 failed, 41 passed, 43 total"), Some(41));
        assert_eq!(parse_test_count("  12 passing (3s)"), Some(12));
        assert_eq!(parse_test_count("Ran 7 tests in 0.1s"), Some(7));
        assert_eq!(parse_test_count("no numbers here"), None);
    }

    #[test]
    fn test_count_regression_is_reported() {
        let mut tracker = TestCountTracker::default();
        assert_eq!(tracker.observe("10 passed"), None);
        assert_eq!(tracker.observe("12 passed"), None);
        assert_eq!(tracker.observe("9 passed"), Some((12, 9)));
        assert_eq!(tracker.observe("unparseable"), None);
        assert_eq!(tracker.observe("9 passed"), None);
    }

    #[tokio::test]
    async fn test_validator_runs_configured_commands() {
        let dir = tempdir().unwrap();
        let toml = SddToml::parse(
            "[validation]\nbuild = [\"true\"]\ntest = { shell = \"echo '5 passed'; exit 1\" }\n",
        )
        .unwrap();
        let mut config = crate::config::Config::from_toml(dir.path().to_path_buf(), toml, false).unwrap();
        config.validation.advisory = vec![
            AdvisoryCheck {
                name: "lint".into(),
                command: CommandSpec::argv(["false"]),
            },
            AdvisoryCheck {
                name: "ok".into(),
                command: CommandSpec::argv(["true"]),
            },
        ];

        let validator = Validator::new(&config);
        assert!(validator.build().await.unwrap().success);
        let test = validator.test().await.unwrap();
        assert!(!test.success);
        assert!(test.output.contains("5 passed"));
        assert_eq!(validator.advisory().await, vec!["lint"]);
    }

    #[tokio::test]
    async fn test_missing_commands_are_skipped() {
        let dir = tempdir().unwrap();
        let config =
            crate::config::Config::from_toml(dir.path().to_path_buf(), SddToml::default(), false)
                .unwrap();
        let validator = Validator::new(&config);
        assert!(validator.build().await.unwrap().success);
        assert!(validator.test().await.unwrap().success);
        assert!(validator.advisory().await.is_empty());
    }

    fn jobs(count: u32) -> Vec<DriftJob> {
        (1..=count)
            .map(|id| DriftJob {
                feature: feature(id),
                commit: format!("sha{id}"),
            })
            .collect()
    }

    fn no_wait_backoff() -> BackoffController {
        BackoffController::new(2, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_parallel_drift_keeps_job_order() {
        let agent = Arc::new(
            ScriptedAgent::new()
                .respond("NO_DRIFT: matches", 0)
                .respond("DRIFT_UNRESOLVABLE: spec says 3 fields", 0)
                .respond("no signal at all", 0),
        );

        let round = parallel_drift(
            agent.clone(),
            jobs(3),
            PathBuf::from("."),
            None,
            1,
            no_wait_backoff(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(agent.calls(), 3);
        assert!(round.halt.is_none());
        let checks = round.checks;
        let ids: Vec<u32> = checks.iter().map(|c| c.feature.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        // with one worker, calls happen in job order
        assert!(checks[0].passed);
        assert!(!checks[1].passed);
        assert_eq!(checks[1].detail, "spec says 3 fields");
        assert!(!checks[2].passed);
    }

    #[tokio::test]
    async fn test_parallel_drift_backs_off_on_rate_limit() {
        let agent = Arc::new(
            ScriptedAgent::new()
                .respond("429 Too Many Requests", 1)
                .respond("NO_DRIFT: matches after backoff", 0)
                .respond("NO_DRIFT: matches", 0),
        );

        let round = parallel_drift(
            agent.clone(),
            jobs(2),
            PathBuf::from("."),
            None,
            1,
            no_wait_backoff(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(agent.calls(), 3);
        assert!(round.halt.is_none());
        assert!(round.checks.iter().all(|c| c.passed));
        assert_eq!(round.checks[0].detail, "matches after backoff");
    }

    #[tokio::test]
    async fn test_parallel_drift_credit_exhaustion_halts() {
        let agent = Arc::new(
            ScriptedAgent::new()
                .respond("Error: insufficient_quota", 1)
                .respond("NO_DRIFT: never reached", 0),
        );

        let round = parallel_drift(
            agent.clone(),
            jobs(2),
            PathBuf::from("."),
            None,
            1,
            no_wait_backoff(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(
            round.halt,
            Some(DriftHalt::CreditExhausted("insufficient_quota".into()))
        );
        // the queued job is stopped before it calls the agent
        assert_eq!(agent.calls(), 1);
        assert!(round.checks.iter().all(|c| !c.passed));
    }

    #[tokio::test]
    async fn test_parallel_drift_honours_cancel() {
        let agent = Arc::new(ScriptedAgent::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let round = parallel_drift(
            agent.clone(),
            jobs(2),
            PathBuf::from("."),
            None,
            2,
            no_wait_backoff(),
            cancel,
        )
        .await;
        assert_eq!(round.halt, Some(DriftHalt::Interrupted));
        assert_eq!(agent.calls(), 0);
        assert_eq!(round.checks.len(), 2);
    }

    #[test]
    fn test_drift_workers_bounds() {
        assert_eq!(drift_workers(0), 1);
        assert!(drift_workers(1) == 1);
        assert!(drift_workers(64) >= 1);
    }
}
