//! The hidden `sidecar` entry point and `summary`.

use anyhow::Result;
use autosdd::config::Config;
use autosdd::logging;
use autosdd::sidecar::campaign::load_records;
use autosdd::sidecar::{CampaignSummary, build_loop};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{cancel_on_signal, project_agent};

pub async fn cmd_sidecar(project_dir: &Path, verbose: bool) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), verbose)?;
    let _log_guard = logging::init_sidecar(&config.log_dir)?;

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_signal(cancel.clone()));

    let agent = config.sidecar.agent_eval.then(|| project_agent(&config));
    info!(
        pid = std::process::id(),
        agent_eval = agent.is_some(),
        interval_secs = config.sidecar.interval_secs,
        "Eval sidecar starting"
    );

    let report = build_loop(&config, agent, cancel)?.run().await;
    watcher.abort();
    let report = report?;

    info!(
        evaluated = report.stats.evaluated,
        errors = report.stats.errors,
        skipped = report.stats.skipped,
        drained = report.drained,
        "Eval sidecar finished"
    );
    Ok(())
}

pub fn cmd_summary(project_dir: &Path, verbose: bool) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), verbose)?;
    let _log_guard = logging::init(verbose, None)?;

    let records = load_records(&config.eval_dir)?;
    if records.is_empty() {
        println!("No evaluation results in {}.", config.eval_dir.display());
        return Ok(());
    }
    println!("{}", CampaignSummary::from_records(&records).render());
    Ok(())
}
