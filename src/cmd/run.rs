//! `autosdd run`: build the pending roadmap.

use anyhow::{Result, bail};
use autosdd::config::{CliOverrides, Config};
use autosdd::dag::schedule;
use autosdd::lock;
use autosdd::logging;
use autosdd::pipeline::Orchestrator;
use autosdd::roadmap::load_roadmap;
use autosdd::sidecar::SidecarSession;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{cancel_on_signal, project_agent};

pub async fn cmd_run(project_dir: &Path, verbose: bool, overrides: &CliOverrides) -> Result<()> {
    let mut config = Config::new(project_dir.to_path_buf(), verbose)?;
    config.apply_cli(overrides);
    config.ensure_directories()?;
    let _log_guard = logging::init(verbose, Some(&config.log_dir))?;

    let features = load_roadmap(&config.roadmap_file)?;
    let queue = schedule(&features)?;
    if queue.is_empty() {
        println!("No pending features in {}.", config.roadmap_file.display());
        return Ok(());
    }

    let lock = lock::acquire(&config.lock_file)?;
    info!(
        features = queue.len(),
        strategy = %config.strategy,
        max_retries = config.retry.max_retries,
        "Starting build"
    );

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_signal(cancel.clone()));

    let sidecar = if config.sidecar.enabled {
        match SidecarSession::spawn(&config) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, "Eval sidecar unavailable, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let result = async {
        let mut orchestrator = Orchestrator::new(&config, project_agent(&config), cancel.clone())?;
        orchestrator.run(&queue).await
    }
    .await;

    if let Some(session) = sidecar {
        match session.drain().await {
            Ok(outcome) => info!(?outcome, "Eval sidecar stopped"),
            Err(e) => warn!(error = %e, "Failed to stop eval sidecar"),
        }
    }
    watcher.abort();
    lock.release();

    let report = result?;
    println!();
    println!("{}", report.render_table());
    match report.write(&config.log_dir) {
        Ok(path) => println!("Summary: {}", path.display()),
        Err(e) => warn!(error = %e, "Failed to write build summary"),
    }

    if let Some(reason) = &report.halt_reason {
        bail!("Run halted: {reason}");
    }
    Ok(())
}
