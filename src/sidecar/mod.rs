//! Background evaluation sidecar.
//!
//! A separate `autosdd sidecar` process that watches the project's commit
//! log while a build runs. Every new non-merge commit is measured
//! mechanically (diff size, exported types, redeclarations, imports, test
//! files) and, when enabled, judged by an eval agent. One JSON record per
//! feature lands in `logs/evals/`; the orchestrator reads the newest one as
//! advisory feedback for the next feature.
//!
//! The sidecar only reads git state. Its sole contract with the
//! orchestrator is the drain sentinel file: once it appears the sidecar
//! stops waiting between polls, evaluates everything outstanding, writes
//! the campaign summary, removes the sentinel and exits.

pub mod campaign;
mod coordinator;
mod evaluator;
mod poller;
mod result;

pub use campaign::CampaignSummary;
pub use coordinator::{DrainOutcome, SessionState, SidecarSession};
pub use evaluator::{EvalStats, Evaluator, mechanical_eval};
pub use poller::{LoopReport, SidecarLoop};
pub use result::{AgentEval, EvalRecord, MechanicalEval, sanitize_name, write_json_atomic};

use crate::agent::Agent;
use crate::config::Config;
use crate::git::GitOps;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Assemble the polling loop for `config`. Agent evals are enabled when
/// `agent` is given.
pub fn build_loop(
    config: &Config,
    agent: Option<Arc<dyn Agent>>,
    cancel: CancellationToken,
) -> Result<SidecarLoop> {
    let git = GitOps::open(&config.project_dir)?;

    let mut evaluator = Evaluator::new(&config.project_dir, &config.eval_dir);
    if let Some(dir) = config.relative(&config.checkpoint_file).parent() {
        evaluator = evaluator.with_bookkeeping_prefix(format!("{}/", dir.display()));
    }
    if let Some(agent) = agent {
        let model = config.sidecar.model.clone().or_else(|| config.model.clone());
        evaluator = evaluator.with_agent(agent, model, config.retry.backoff());
    }

    Ok(SidecarLoop::new(
        git,
        evaluator,
        &config.drain_sentinel,
        &config.eval_dir,
        Duration::from_secs(config.sidecar.interval_secs),
        cancel,
    ))
}
