//! Drives the scheduled queue through the per-feature stage machine.

use super::feedback::FeedbackTracker;
use super::report::{FeatureReport, Outcome, RunReport};
use super::stage::{FeatureState, StageResult, next_state};
use super::validate::{
    DriftHalt, DriftJob, TestCountTracker, Validator, drift_workers, parallel_drift,
};
use crate::agent::{Agent, AgentOutput, AgentRequest, write_transcript};
use crate::config::Config;
use crate::dag::ScheduledFeature;
use crate::errors::OrchestratorError;
use crate::git::GitOps;
use crate::project_config::BranchStrategy;
use crate::prompt::{DEFAULT_CONTEXT_TOKENS, PromptContext, drift_prompt, load_for_context, review_prompt};
use crate::retry::{AttemptEvidence, RetryContext, infer_success, tail_chars};
use crate::signals::{BUILD_STAGE, DRIFT_STAGE, REVIEW_STAGE, SignalKey, StageVerdict};
use crate::state::{RunState, StateStore};
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const INTERRUPTED: &str = "Interrupted by signal";

/// What one agent call amounted to.
enum AgentCall {
    Output(AgentOutput),
    /// Counts as a failed attempt
    Failed(String),
    CreditExhausted(String),
    Interrupted,
}

/// Scratch data for the feature being built.
#[derive(Debug, Default)]
struct FeatureRun {
    branch: String,
    start_sha: String,
    spec_file: String,
    source_files: String,
    /// No success signal on a retry; success must be shown mechanically
    needs_inference: bool,
    evidence: AttemptEvidence,
    warnings: Vec<String>,
    halt_reason: Option<String>,
}

/// How a feature ended.
#[derive(Debug)]
struct FeatureResult {
    state: FeatureState,
    attempts: u32,
    branch: String,
    commit: Option<String>,
    warnings: Vec<String>,
    halt_reason: Option<String>,
}

pub struct Orchestrator<'a> {
    config: &'a Config,
    agent: Arc<dyn Agent>,
    git: GitOps,
    store: StateStore,
    feedback: FeedbackTracker,
    test_counts: TestCountTracker,
    cancel: CancellationToken,
    roadmap_context: String,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a Config, agent: Arc<dyn Agent>, cancel: CancellationToken) -> Result<Self> {
        let git = GitOps::open(&config.project_dir)?;
        git.require_head()?;
        Ok(Self {
            store: StateStore::new(config.state_file.clone()),
            feedback: FeedbackTracker::new(&config.eval_dir),
            test_counts: TestCountTracker::default(),
            roadmap_context: load_for_context(&config.roadmap_file, DEFAULT_CONTEXT_TOKENS),
            config,
            agent,
            git,
            cancel,
        })
    }

    /// Branch features start from: configured, else the one checked out now,
    /// else the detached HEAD commit.
    fn base_branch(&self) -> Result<String> {
        if let Some(base) = &self.config.base_branch {
            return Ok(base.clone());
        }
        match self.git.current_branch() {
            Some(branch) => Ok(branch),
            None => self.git.require_head(),
        }
    }

    /// Build every feature in `queue`, in order.
    ///
    /// A fresh state file is written before the first feature. Features
    /// already listed in the resume state are skipped. A credit
    /// exhaustion or an interrupt halts the run; the state file is then left
    /// in place for the next invocation. Otherwise the state file is removed
    /// once the queue is exhausted.
    pub async fn run(&mut self, queue: &[ScheduledFeature]) -> Result<RunReport> {
        let mut report = RunReport::new();
        let strategy = self.config.strategy;
        let base = self.base_branch()?;

        let mut state = match self.store.read()? {
            Some(prior) => {
                info!(
                    completed = prior.completed_features.len(),
                    branch = %prior.current_branch,
                    "Resuming previous run"
                );
                if prior.branch_strategy != strategy.to_string() {
                    warn!(
                        previous = %prior.branch_strategy,
                        current = %strategy,
                        "Branch strategy changed since the previous run"
                    );
                }
                prior
            }
            None => {
                let fresh = RunState::new(strategy.to_string(), base.clone());
                self.store.write(&fresh)?;
                fresh
            }
        };

        let mut chain_from = base.clone();
        if strategy == BranchStrategy::Chained && self.git.branch_exists(&state.current_branch) {
            chain_from = state.current_branch.clone();
        }

        let mut built: Vec<DriftJob> = Vec::new();
        let mut stopped = false;

        for (index, feature) in queue.iter().enumerate() {
            if state.is_completed(&feature.name) {
                info!(id = feature.id, name = %feature.name, "Already completed, skipping");
                report.push(entry(feature, Outcome::Skipped));
                continue;
            }
            if stopped || self.cancel.is_cancelled() {
                stopped = true;
                report.push(entry(feature, Outcome::NotAttempted));
                continue;
            }

            info!(
                progress = %format!("{}/{}", index + 1, queue.len()),
                id = feature.id,
                name = %feature.name,
                complexity = %feature.complexity,
                "Building feature"
            );
            let started = Instant::now();
            let result = self.build_feature(feature, &base, &chain_from).await?;

            let mut feature_report = entry(feature, Outcome::Failed);
            feature_report.attempts = result.attempts;
            feature_report.duration_secs = started.elapsed().as_secs_f64();
            feature_report.branch = Some(result.branch.clone());
            feature_report.warnings = result.warnings;

            match result.state {
                FeatureState::Committed => {
                    feature_report.outcome = Outcome::Built;
                    state.record_completed(&feature.name);
                    state.feature_index = index + 1;
                    state.current_branch = result.branch.clone();
                    self.store.write(&state)?;
                    self.checkpoint(&feature.name);
                    self.prune(&base);
                    if strategy == BranchStrategy::Chained {
                        chain_from = result.branch.clone();
                    }
                    if let Some(commit) = result.commit {
                        built.push(DriftJob {
                            feature: feature.clone(),
                            commit,
                        });
                    }
                    info!(id = feature.id, name = %feature.name, attempts = result.attempts, "Feature committed");
                }
                FeatureState::Halted => {
                    let reason = result.halt_reason.unwrap_or_else(|| INTERRUPTED.to_string());
                    error!(id = feature.id, reason = %reason, "Run halted");
                    report.halt(reason);
                    stopped = true;
                }
                _ => {
                    error!(
                        id = feature.id,
                        name = %feature.name,
                        attempts = result.attempts,
                        "Feature failed, moving on"
                    );
                }
            }
            report.push(feature_report);
        }

        if stopped && !report.halted {
            report.halt(INTERRUPTED);
        }

        if !report.halted {
            self.run_parallel_drift(built, &mut report).await;
        }
        if !report.halted {
            self.store.clean()?;
        }
        report.finish();
        Ok(report)
    }

    async fn build_feature(
        &mut self,
        feature: &ScheduledFeature,
        base: &str,
        chain_from: &str,
    ) -> Result<FeatureResult> {
        let branch = self.setup_branch(feature, base, chain_from)?;
        let start_sha = self.git.require_head()?;
        let mut ctx = RetryContext::new(&start_sha);
        let mut run = FeatureRun {
            branch,
            start_sha,
            ..Default::default()
        };

        let mut current = next_state(FeatureState::BranchSetup, &StageResult::Advance, true);
        let mut last_failure = String::new();

        while !current.is_terminal() {
            let result = match current {
                FeatureState::AgentInvoked => self.invoke_build(feature, &ctx, &mut run).await?,
                FeatureState::ValidateBuild => self.validate_build().await,
                FeatureState::ValidateTest => self.validate_test(&ctx, &mut run).await,
                FeatureState::ValidateDrift => self.validate_drift(feature, &ctx, &mut run).await?,
                FeatureState::ValidateReview => self.validate_review(feature, &ctx, &mut run).await?,
                FeatureState::Retry => self.prepare_retry(&mut ctx, &mut run, &last_failure).await?,
                FeatureState::Queued | FeatureState::BranchSetup => StageResult::Advance,
                FeatureState::Committed | FeatureState::Failed | FeatureState::Halted => break,
            };

            match &result {
                StageResult::Fail(output) => {
                    warn!(
                        id = feature.id,
                        stage = %current,
                        attempt = ctx.attempt + 1,
                        "Stage failed"
                    );
                    if current == FeatureState::ValidateReview {
                        run.warnings.push(format!("review: {}", first_line(output)));
                    }
                    last_failure = output.clone();
                }
                StageResult::Halt(reason) => run.halt_reason = Some(reason.clone()),
                StageResult::Advance => {}
            }

            current = next_state(current, &result, self.config.retry.allows_retry(ctx.attempt));
        }

        let mut commit = None;
        match current {
            FeatureState::Committed => {
                if let Some(sha) = self
                    .git
                    .commit_all(&format!("feat: {}", feature.name), &self.config.preserve)?
                {
                    info!(sha = %sha, "Committed uncommitted agent changes");
                }
                commit = self.git.head_sha();
            }
            _ if self.config.strategy == BranchStrategy::Sequential => {
                // nothing from an unfinished feature may stay on the shared branch
                self.git.reset_hard(&run.start_sha)?;
                self.git.clean_untracked(&self.config.preserve)?;
                info!(id = feature.id, state = %current, "Reset shared branch to the feature's start");
            }
            _ => {}
        }

        Ok(FeatureResult {
            state: current,
            attempts: ctx.attempt + 1,
            branch: run.branch,
            commit,
            warnings: run.warnings,
            halt_reason: run.halt_reason,
        })
    }

    fn setup_branch(&mut self, feature: &ScheduledFeature, base: &str, chain_from: &str) -> Result<String> {
        self.git.stash_dirty(
            &format!("autosdd: before feature {}", feature.id),
            &self.config.preserve,
        )?;

        let name = format!("{}{}", self.config.branch_prefix, feature.id);
        match self.config.strategy {
            BranchStrategy::Sequential => Ok(self
                .git
                .current_branch()
                .unwrap_or_else(|| base.to_string())),
            BranchStrategy::Chained => {
                self.git.checkout_new_branch(&name, chain_from)?;
                info!(branch = %name, from = %chain_from, "Created feature branch");
                Ok(name)
            }
            BranchStrategy::Independent => {
                self.git.checkout_new_branch(&name, base)?;
                info!(branch = %name, from = %base, "Created feature branch");
                Ok(name)
            }
        }
    }

    /// Call the agent with rate-limit backoff, stopping early on interrupt.
    async fn call_agent(
        &self,
        request: AgentRequest,
        feature_id: u32,
        attempt: u32,
        stage: &str,
    ) -> Result<AgentCall> {
        let backoff = self.config.retry.backoff();
        let outcome = tokio::select! {
            outcome = backoff.invoke(self.agent.as_ref(), &request) => outcome,
            _ = self.cancel.cancelled() => return Ok(AgentCall::Interrupted),
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(
                    e.downcast_ref::<OrchestratorError>(),
                    Some(OrchestratorError::AgentSpawn(_))
                ) {
                    return Err(e);
                }
                warn!(stage, error = %e, "Agent call failed");
                return Ok(AgentCall::Failed(e.to_string()));
            }
        };

        let stem = self.config.transcript_stem(feature_id, attempt, stage);
        if let Err(e) = write_transcript(&stem, &request, &outcome.output) {
            warn!(error = %e, "Failed to write agent transcript");
        }

        if let Some(matched) = outcome.credit_exhausted {
            return Ok(AgentCall::CreditExhausted(matched));
        }
        if outcome.exhausted {
            return Ok(AgentCall::Failed(format!(
                "Still rate limited after {} retries\n{}",
                outcome.retries(),
                outcome.output.text
            )));
        }
        Ok(AgentCall::Output(outcome.output))
    }

    async fn invoke_build(
        &mut self,
        feature: &ScheduledFeature,
        ctx: &RetryContext,
        run: &mut FeatureRun,
    ) -> Result<StageResult> {
        let feedback = self.feedback.collect();
        let mut prompt = PromptContext::new(feature);
        prompt.attempt = ctx.attempt;
        prompt.prior_failure = ctx.last_failure.as_deref();
        prompt.feedback = feedback.as_deref();
        prompt.roadmap = Some(self.roadmap_context.as_str());

        info!(id = feature.id, attempt = ctx.attempt + 1, "Invoking agent");
        let request = AgentRequest::new(prompt.build_prompt(), &self.config.project_dir)
            .with_model(self.config.model.clone());

        let output = match self.call_agent(request, feature.id, ctx.attempt + 1, "build").await? {
            AgentCall::Output(output) => output,
            other => return Ok(unusable_call(other)),
        };

        let signals = output.signals();
        run.spec_file = signals.get(SignalKey::SpecFile).to_string();
        run.source_files = signals.get(SignalKey::SourceFiles).to_string();
        run.needs_inference = false;

        match BUILD_STAGE.evaluate(&signals) {
            StageVerdict::Passed { value, .. } => {
                info!(built = %value, "Agent reported feature built");
                Ok(StageResult::Advance)
            }
            verdict if ctx.is_retry() => {
                // a retry may still have succeeded; only the tree can say
                let head_advanced = self.git.head_sha().as_deref() != Some(run.start_sha.as_str());
                let tree_clean = self.git.is_clean(&self.config.preserve)?;
                run.evidence = AttemptEvidence {
                    attempt: ctx.attempt,
                    head_advanced,
                    tree_clean,
                    ..Default::default()
                };
                if head_advanced && tree_clean {
                    info!(?verdict, "No success signal on retry, checking the work mechanically");
                    run.needs_inference = true;
                    Ok(StageResult::Advance)
                } else {
                    Ok(StageResult::Fail(output.text))
                }
            }
            StageVerdict::Failed { reason, .. } => {
                warn!(reason = %reason, "Agent reported build failure");
                Ok(StageResult::Fail(output.text))
            }
            StageVerdict::NoSignal => {
                warn!("Agent output carried no build signal");
                Ok(StageResult::Fail(output.text))
            }
        }
    }

    async fn validate_build(&self) -> StageResult {
        match Validator::new(self.config).build().await {
            Ok(outcome) if outcome.success => StageResult::Advance,
            Ok(outcome) => StageResult::Fail(outcome.output),
            Err(e) => StageResult::Fail(format!("Build command could not run: {e:#}")),
        }
    }

    async fn validate_test(&mut self, ctx: &RetryContext, run: &mut FeatureRun) -> StageResult {
        let validator = Validator::new(self.config);
        let outcome = match validator.test().await {
            Ok(outcome) if outcome.success => outcome,
            Ok(outcome) => return StageResult::Fail(outcome.output),
            Err(e) => return StageResult::Fail(format!("Test command could not run: {e:#}")),
        };

        if let Some((previous, current)) = self.test_counts.observe(&outcome.output) {
            run.warnings
                .push(format!("test count dropped from {previous} to {current}"));
        }
        for name in validator.advisory().await {
            run.warnings.push(format!("advisory check failed: {name}"));
        }

        if run.needs_inference {
            run.evidence.build_passed = true;
            run.evidence.test_passed = true;
            if !infer_success(&run.evidence) {
                return StageResult::Fail("Retry gave no success signal and its work could not be verified".into());
            }
            info!(attempt = ctx.attempt + 1, "Inferred success from a verified retry");
        }
        StageResult::Advance
    }

    fn parallel_drift_enabled(&self) -> bool {
        self.config.strategy == BranchStrategy::Independent && self.config.validation.parallel_drift
    }

    async fn validate_drift(
        &mut self,
        feature: &ScheduledFeature,
        ctx: &RetryContext,
        run: &mut FeatureRun,
    ) -> Result<StageResult> {
        if !self.config.validation.drift || self.parallel_drift_enabled() {
            return Ok(StageResult::Advance);
        }
        if run.spec_file.is_empty() {
            warn!(id = feature.id, "No SPEC_FILE reported, skipping drift check");
            run.warnings.push("drift check skipped: no spec file".into());
            return Ok(StageResult::Advance);
        }

        let request = AgentRequest::new(
            drift_prompt(feature, &run.spec_file, &run.source_files),
            &self.config.project_dir,
        )
        .with_model(self.config.drift_model.clone().or_else(|| self.config.model.clone()));

        let output = match self.call_agent(request, feature.id, ctx.attempt + 1, "drift").await? {
            AgentCall::Output(output) => output,
            other => return Ok(unusable_call(other)),
        };

        match DRIFT_STAGE.evaluate(&output.signals()) {
            StageVerdict::Passed { signal: SignalKey::DriftFixed, value } => {
                info!(fix = %value, "Drift fixed, re-validating");
                if let StageResult::Fail(out) = self.validate_build().await {
                    return Ok(StageResult::Fail(out));
                }
                Ok(self.validate_test(ctx, run).await)
            }
            StageVerdict::Passed { .. } => Ok(StageResult::Advance),
            StageVerdict::Failed { reason, .. } => {
                warn!(reason = %reason, "Unresolvable drift");
                Ok(StageResult::Fail(output.text))
            }
            StageVerdict::NoSignal => Ok(StageResult::Fail(output.text)),
        }
    }

    async fn validate_review(
        &mut self,
        feature: &ScheduledFeature,
        ctx: &RetryContext,
        run: &mut FeatureRun,
    ) -> Result<StageResult> {
        if !self.config.validation.review {
            return Ok(StageResult::Advance);
        }
        let summary = self.change_summary(&run.start_sha);
        let request = AgentRequest::new(review_prompt(feature, &summary), &self.config.project_dir)
            .with_model(self.config.review_model.clone().or_else(|| self.config.model.clone()));

        match self.call_agent(request, feature.id, ctx.attempt + 1, "review").await? {
            AgentCall::Output(output) => match REVIEW_STAGE.evaluate(&output.signals()) {
                StageVerdict::Failed { reason, .. } => Ok(StageResult::Fail(reason)),
                _ => Ok(StageResult::Advance),
            },
            call @ (AgentCall::CreditExhausted(_) | AgentCall::Interrupted) => Ok(unusable_call(call)),
            AgentCall::Failed(reason) => {
                warn!(reason = %first_line(&reason), "Review could not run (non-blocking)");
                Ok(StageResult::Advance)
            }
        }
    }

    /// `path | +added -removed` lines for everything committed since `since`.
    fn change_summary(&self, since: &str) -> String {
        let Some(head) = self.git.head_sha() else {
            return String::new();
        };
        let mut lines = Vec::new();
        for sha in self.git.commits_between(since, &head).unwrap_or_default() {
            for stat in self.git.diff_numstat(&sha).unwrap_or_default() {
                lines.push(format!("{} | +{} -{}", stat.path, stat.added, stat.removed));
            }
        }
        lines.join("\n")
    }

    async fn prepare_retry(
        &mut self,
        ctx: &mut RetryContext,
        run: &mut FeatureRun,
        last_failure: &str,
    ) -> Result<StageResult> {
        let delay = self.config.retry.min_retry_delay;
        info!(
            attempt = ctx.attempt + 2,
            max = self.config.retry.max_retries + 1,
            delay_secs = delay.as_secs(),
            "Retrying feature"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.cancelled() => return Ok(StageResult::Halt(INTERRUPTED.into())),
        }

        self.git.reset_hard(&run.start_sha)?;
        let removed = self.git.clean_untracked(&self.config.preserve)?;
        if !removed.is_empty() {
            info!(count = removed.len(), "Removed untracked files left by the failed attempt");
        }
        ctx.advance(last_failure, self.config.retry.failure_context_chars);
        run.needs_inference = false;
        Ok(StageResult::Advance)
    }

    /// Commit a copy of the state file. Forensic only, so failures just warn.
    fn checkpoint(&self, name: &str) {
        let dest = &self.config.checkpoint_file;
        let result = self.store.copy_to(dest).and_then(|()| {
            self.git.commit_paths(
                &[self.config.relative(dest)],
                &format!("state: checkpoint {name}"),
            )
        });
        if let Err(e) = result {
            warn!(error = %e, "Failed to commit state checkpoint");
        }
    }

    fn prune(&self, base: &str) {
        if !self.config.prune_merged || self.config.strategy == BranchStrategy::Sequential {
            return;
        }
        if let Err(e) = self.git.prune_merged(&self.config.branch_prefix, base) {
            warn!(error = %e, "Failed to prune merged branches");
        }
    }

    async fn run_parallel_drift(&self, built: Vec<DriftJob>, report: &mut RunReport) {
        if !self.parallel_drift_enabled() || !self.config.validation.drift || built.is_empty() {
            return;
        }
        let workers = drift_workers(built.len());
        let model = self.config.drift_model.clone().or_else(|| self.config.model.clone());
        let round = parallel_drift(
            self.agent.clone(),
            built,
            self.config.project_dir.clone(),
            model,
            workers,
            self.config.retry.backoff(),
            self.cancel.clone(),
        )
        .await;

        match round.halt {
            Some(DriftHalt::CreditExhausted(matched)) => {
                let reason = OrchestratorError::CreditExhausted { matched }.to_string();
                error!(reason = %reason, "Run halted during drift checks");
                report.halt(reason);
            }
            Some(DriftHalt::Interrupted) => report.halt(INTERRUPTED),
            None => {}
        }

        for check in round.checks.into_iter().filter(|c| !c.passed) {
            warn!(
                id = check.feature.id,
                detail = %tail_chars(&check.detail, 200),
                "Drift detected (non-blocking)"
            );
            if let Some(feature) = report.feature_mut(check.feature.id) {
                feature.warnings.push(format!("drift: {}", check.detail));
            }
        }
    }
}

fn entry(feature: &ScheduledFeature, outcome: Outcome) -> FeatureReport {
    FeatureReport {
        id: feature.id,
        name: feature.name.clone(),
        outcome,
        attempts: 0,
        duration_secs: 0.0,
        branch: None,
        warnings: Vec::new(),
    }
}

fn unusable_call(call: AgentCall) -> StageResult {
    match call {
        AgentCall::CreditExhausted(matched) => {
            StageResult::Halt(OrchestratorError::CreditExhausted { matched }.to_string())
        }
        AgentCall::Interrupted => StageResult::Halt(INTERRUPTED.to_string()),
        AgentCall::Failed(reason) => StageResult::Fail(reason),
        AgentCall::Output(output) => StageResult::Fail(output.text),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedAgent;
    use crate::git::test_support::{commit_file, init_repo};
    use crate::project_config::SddToml;
    use crate::roadmap::Complexity;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    const BUILT: &str = "done\nFEATURE_BUILT: ok\n";

    fn feature(id: u32) -> ScheduledFeature {
        ScheduledFeature {
            id,
            name: format!("Feature {id}"),
            complexity: Complexity::Small,
        }
    }

    fn project(toml: &str) -> (tempfile::TempDir, Config) {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "README.md", "project\n", "initial");
        let toml = SddToml::parse(&format!("[validation]\ndrift = false\n{toml}")).unwrap();
        let mut config = Config::from_toml(dir.path().to_path_buf(), toml, false).unwrap();
        config.retry.min_retry_delay = Duration::ZERO;
        config.ensure_directories().unwrap();
        (dir, config)
    }

    fn write(name: &'static str) -> impl Fn(&Path) + Send + Sync + 'static {
        move |dir: &Path| std::fs::write(dir.join(name), "content\n").unwrap()
    }

    async fn run(config: &Config, agent: Arc<ScriptedAgent>, queue: &[ScheduledFeature]) -> Result<RunReport> {
        let mut orchestrator = Orchestrator::new(config, agent, CancellationToken::new())?;
        orchestrator.run(queue).await
    }

    #[tokio::test]
    async fn test_chained_features_build_on_each_other() {
        let (dir, config) = project("");
        let agent = Arc::new(
            ScriptedAgent::new()
                .respond_with(BUILT, 0, write("one.txt"))
                .respond_with(BUILT, 0, write("two.txt")),
        );

        let report = run(&config, agent.clone(), &[feature(1), feature(2)]).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.totals.built, 2);
        assert_eq!(agent.calls(), 2);

        let git = GitOps::open(dir.path()).unwrap();
        assert_eq!(git.current_branch().as_deref(), Some("auto/feature-2"));
        assert!(dir.path().join("one.txt").exists());
        assert!(git.is_clean(&config.preserve).unwrap());
        // queue exhausted: live state removed, checkpoint committed
        assert!(!config.state_file.exists());
        assert!(config.checkpoint_file.exists());
        assert!(dir.path().join("logs/feature-1-attempt-1-build-prompt.md").exists());
    }

    #[tokio::test]
    async fn test_failed_attempt_is_reset_and_retried_with_context() {
        let (dir, config) = project("");
        let agent = Arc::new(
            ScriptedAgent::new()
                .respond_with("BUILD_FAILED: type error in parser.ts", 0, write("junk.txt"))
                .respond_with(BUILT, 0, write("good.txt")),
        );

        let report = run(&config, agent.clone(), &[feature(1)]).await.unwrap();
        assert_eq!(report.features[0].outcome, Outcome::Built);
        assert_eq!(report.features[0].attempts, 2);
        assert!(!dir.path().join("junk.txt").exists());
        assert!(dir.path().join("good.txt").exists());

        let prompts = agent.requests();
        assert!(!prompts[0].prompt.contains("Previous attempt failed"));
        assert!(prompts[1].prompt.contains("type error in parser.ts"));
    }

    #[tokio::test]
    async fn test_build_command_failure_consumes_retries() {
        let (_dir, config) = project("build = { shell = \"test -f built.txt\" }\n");
        let agent = Arc::new(ScriptedAgent::new().respond(BUILT, 0).respond(BUILT, 0));

        let report = run(&config, agent.clone(), &[feature(1)]).await.unwrap();
        // one retry per feature by default
        assert_eq!(report.features[0].outcome, Outcome::Failed);
        assert_eq!(report.features[0].attempts, 2);
        assert_eq!(report.totals.failed, 1);
        assert!(!report.halted);
        assert_eq!(agent.calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_success_inferred_from_clean_advanced_tree() {
        let (_dir, config) = project("build = [\"true\"]\ntest = [\"true\"]\n");
        let agent = Arc::new(
            ScriptedAgent::new()
                .respond("BUILD_FAILED: flaky", 0)
                .respond_with("I think it works now", 0, |dir: &Path| {
                    commit_file(dir, "feature.ts", "export const x = 1;\n", "feat: Feature 1");
                }),
        );

        let report = run(&config, agent, &[feature(1)]).await.unwrap();
        assert_eq!(report.features[0].outcome, Outcome::Built);
        assert_eq!(report.features[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_retry_without_progress_is_not_inferred() {
        let (_dir, config) = project("");
        let agent = Arc::new(
            ScriptedAgent::new()
                .respond("BUILD_FAILED: flaky", 0)
                .respond("still thinking", 0),
        );

        let report = run(&config, agent, &[feature(1)]).await.unwrap();
        assert_eq!(report.features[0].outcome, Outcome::Failed);
    }

    #[tokio::test]
    async fn test_credit_exhaustion_halts_whole_run() {
        let (_dir, config) = project("");
        let agent = Arc::new(
            ScriptedAgent::new()
                .respond("Error 402: payment required, insufficient_quota", 1)
                .respond(BUILT, 0),
        );

        let report = run(&config, agent.clone(), &[feature(1), feature(2)]).await.unwrap();
        assert!(report.halted);
        assert!(report.halt_reason.as_deref().unwrap().contains("credits exhausted"));
        assert_eq!(agent.calls(), 1);
        assert_eq!(report.features[0].attempts, 1);
        assert_eq!(report.features[1].outcome, Outcome::NotAttempted);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_features() {
        let (_dir, config) = project("");
        let mut prior = RunState::new("chained", "auto/feature-1");
        prior.record_completed("Feature 1");
        prior.feature_index = 1;
        StateStore::new(config.state_file.clone()).write(&prior).unwrap();

        let agent = Arc::new(ScriptedAgent::new().respond_with(BUILT, 0, write("two.txt")));
        let report = run(&config, agent.clone(), &[feature(1), feature(2)]).await.unwrap();

        assert_eq!(agent.calls(), 1);
        assert!(agent.requests()[0].prompt.contains("Feature 2"));
        assert_eq!(report.features[0].outcome, Outcome::Skipped);
        assert_eq!(report.features[1].outcome, Outcome::Built);
    }

    #[tokio::test]
    async fn test_corrupt_state_fails_loudly() {
        let (_dir, config) = project("");
        std::fs::write(&config.state_file, "{ not json").unwrap();

        let agent = Arc::new(ScriptedAgent::new());
        let err = run(&config, agent.clone(), &[feature(1)]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::StateCorrupt { .. })
        ));
        assert_eq!(agent.calls(), 0);
    }

    #[tokio::test]
    async fn test_dirty_tree_is_stashed_before_next_feature() {
        let (dir, config) = project("");
        std::fs::write(dir.path().join("stray.txt"), "left over\n").unwrap();
        let agent = Arc::new(ScriptedAgent::new().respond(BUILT, 0));

        let report = run(&config, agent, &[feature(1)]).await.unwrap();
        assert!(report.is_success());
        assert!(!dir.path().join("stray.txt").exists());
    }

    #[tokio::test]
    async fn test_sequential_failure_leaves_branch_untouched() {
        let (dir, mut config) = project("");
        config.strategy = BranchStrategy::Sequential;
        config.retry.max_retries = 0;
        let before = GitOps::open(dir.path()).unwrap().head_sha();

        let agent = Arc::new(ScriptedAgent::new().respond_with("BUILD_FAILED: no", 0, |dir: &Path| {
            commit_file(dir, "half.ts", "x\n", "wip");
        }));
        let report = run(&config, agent, &[feature(1)]).await.unwrap();

        assert_eq!(report.features[0].outcome, Outcome::Failed);
        assert_eq!(GitOps::open(dir.path()).unwrap().head_sha(), before);
    }

    #[tokio::test]
    async fn test_sequential_halt_after_commit_resets_branch() {
        let (dir, mut config) = project("");
        config.strategy = BranchStrategy::Sequential;
        config.retry.max_retries = 0;
        config.validation.review = true;
        let before = GitOps::open(dir.path()).unwrap().head_sha();

        let agent = Arc::new(
            ScriptedAgent::new()
                .respond_with(BUILT, 0, |dir: &Path| {
                    commit_file(dir, "half.ts", "x\n", "feat: Feature 1");
                })
                .respond("Error: insufficient_quota", 1),
        );
        let report = run(&config, agent.clone(), &[feature(1)]).await.unwrap();

        assert!(report.halted);
        assert_eq!(agent.calls(), 2);
        assert_eq!(GitOps::open(dir.path()).unwrap().head_sha(), before);
        assert!(!dir.path().join("half.ts").exists());
        // halted runs keep their resume state
        assert!(config.state_file.exists());
    }

    #[tokio::test]
    async fn test_drift_and_review_stages() {
        let (dir, mut config) = project("");
        config.validation.drift = true;
        config.validation.review = true;
        let agent = Arc::new(
            ScriptedAgent::new()
                .respond_with(
                    "FEATURE_BUILT: ok\nSPEC_FILE: specs/f1.md\nSOURCE_FILES: src/f1.ts\n",
                    0,
                    |dir: &Path| {
                        commit_file(dir, "src/f1.ts", "export const f = 1;\n", "feat: Feature 1");
                    },
                )
                .respond("DRIFT_UNRESOLVABLE: spec wants two exports", 0)
                .respond_with("FEATURE_BUILT: ok\nSPEC_FILE: specs/f1.md\n", 0, |dir: &Path| {
                    commit_file(dir, "src/f1.ts", "export const f = 1, g = 2;\n", "feat: Feature 1");
                })
                .respond("NO_DRIFT: aligned", 0)
                .respond("REVIEW_FINDINGS: missing input validation", 0),
        );

        let report = run(&config, agent.clone(), &[feature(1)]).await.unwrap();
        let f1 = &report.features[0];
        assert_eq!(f1.outcome, Outcome::Built);
        assert_eq!(f1.attempts, 2);
        assert!(f1.warnings.iter().any(|w| w.contains("missing input validation")));
        assert!(agent.requests()[1].prompt.contains("specs/f1.md"));
        assert!(agent.requests()[2].prompt.contains("spec wants two exports"));
        assert!(agent.requests()[4].prompt.contains("src/f1.ts"));
        assert!(dir.path().join("logs/feature-1-attempt-2-review-output.log").exists());
    }

    #[tokio::test]
    async fn test_parallel_drift_reports_without_blocking() {
        let (_dir, mut config) = project("");
        config.strategy = BranchStrategy::Independent;
        config.validation.drift = true;
        config.validation.parallel_drift = true;
        let agent = Arc::new(
            ScriptedAgent::new()
                .respond_with("FEATURE_BUILT: a\nSPEC_FILE: a.md\n", 0, write("a.txt"))
                .respond_with("FEATURE_BUILT: b\nSPEC_FILE: b.md\n", 0, write("b.txt"))
                .respond("DRIFT_UNRESOLVABLE: a differs", 0)
                .respond("DRIFT_UNRESOLVABLE: b differs", 0),
        );

        let report = run(&config, agent.clone(), &[feature(1), feature(2)]).await.unwrap();
        assert_eq!(agent.calls(), 4);
        assert!(report.is_success());
        assert_eq!(report.totals.built, 2);
        let warned = report
            .features
            .iter()
            .filter(|f| f.warnings.iter().any(|w| w.starts_with("drift:")))
            .count();
        assert_eq!(warned, 2);
    }

    #[tokio::test]
    async fn test_interrupt_before_start_attempts_nothing() {
        let (_dir, config) = project("");
        let agent = Arc::new(ScriptedAgent::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut orchestrator = Orchestrator::new(&config, agent.clone(), cancel).unwrap();
        let report = orchestrator.run(&[feature(1)]).await.unwrap();
        assert!(report.halted);
        assert_eq!(report.halt_reason.as_deref(), Some(INTERRUPTED));
        assert_eq!(agent.calls(), 0);

        // the run state exists from the start, before any feature completes
        let state = StateStore::new(config.state_file.clone()).read().unwrap().unwrap();
        assert!(state.completed_features.is_empty());
        assert_eq!(state.branch_strategy, "chained");
    }

    #[tokio::test]
    async fn test_parallel_drift_credit_exhaustion_halts_run() {
        let (_dir, mut config) = project("");
        config.strategy = BranchStrategy::Independent;
        config.validation.drift = true;
        config.validation.parallel_drift = true;
        let agent = Arc::new(
            ScriptedAgent::new()
                .respond_with("FEATURE_BUILT: a\nSPEC_FILE: a.md\n", 0, write("a.txt"))
                .respond_with("FEATURE_BUILT: b\nSPEC_FILE: b.md\n", 0, write("b.txt"))
                .respond("Error 402: insufficient_quota", 1)
                .respond("NO_DRIFT: fine", 0),
        );

        let report = run(&config, agent, &[feature(1), feature(2)]).await.unwrap();
        assert_eq!(report.totals.built, 2);
        assert!(report.halted);
        assert!(report.halt_reason.as_deref().unwrap().contains("credits exhausted"));
        assert!(config.state_file.exists());
    }
}
