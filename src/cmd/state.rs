//! Build order, resume state and reset.

use anyhow::Result;
use autosdd::config::Config;
use autosdd::dag::schedule;
use autosdd::errors::OrchestratorError;
use autosdd::lock::{process_alive, read_lock_pid};
use autosdd::logging;
use autosdd::roadmap::load_roadmap;
use autosdd::state::StateStore;
use std::path::Path;

pub fn cmd_order(project_dir: &Path, verbose: bool) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), verbose)?;
    let _log_guard = logging::init(verbose, None)?;

    let features = load_roadmap(&config.roadmap_file)?;
    let queue = schedule(&features)?;
    if queue.is_empty() {
        println!("No pending features in {}.", config.roadmap_file.display());
        return Ok(());
    }

    println!("{:<4} {:<5} {:<40} {:<10} Deps", "#", "ID", "Feature", "Size");
    println!("{:<4} {:<5} {:<40} {:<10} ----", "--", "---", "-------", "----");
    for (position, feature) in queue.iter().enumerate() {
        let deps = features
            .iter()
            .find(|f| f.id == feature.id)
            .map(|f| {
                f.deps
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<4} {:<5} {:<40} {:<10} {}",
            position + 1,
            feature.id,
            feature.name,
            feature.complexity,
            deps
        );
    }
    println!();
    println!("{} pending feature(s)", queue.len());
    Ok(())
}

/// PID of a live run holding the project lock.
fn running_pid(config: &Config) -> Option<u32> {
    read_lock_pid(&config.lock_file).filter(|&pid| process_alive(pid))
}

pub fn cmd_status(project_dir: &Path, verbose: bool) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), verbose)?;

    println!();
    println!("autosdd status");
    println!("==============");
    println!();

    match running_pid(&config) {
        Some(pid) => println!("Run:      {} (PID {pid})", console::style("in progress").yellow()),
        None => println!("Run:      idle"),
    }

    let store = StateStore::new(config.state_file.clone());
    match store.read()? {
        None => {
            println!("State:    none");
            println!();
            println!("No saved run state. The next run starts from the beginning.");
        }
        Some(state) => {
            println!("State:    {}", store.path().display());
            println!("Strategy: {}", state.branch_strategy);
            println!("Branch:   {}", state.current_branch);
            println!("Saved:    {}", state.timestamp);
            println!();
            println!("Completed features ({}):", state.completed_features.len());
            for name in &state.completed_features {
                println!("  {} {name}", console::style("✓").green());
            }
        }
    }
    println!();
    Ok(())
}

pub fn cmd_reset(project_dir: &Path, verbose: bool, force: bool) -> Result<()> {
    let config = Config::new(project_dir.to_path_buf(), verbose)?;

    if let Some(pid) = running_pid(&config) {
        if !force {
            return Err(OrchestratorError::LockContention {
                pid,
                path: config.lock_file.clone(),
            }
            .into());
        }
        println!(
            "{} run {pid} still holds the lock; resetting anyway",
            console::style("warning:").yellow()
        );
    }

    StateStore::new(config.state_file.clone()).clean()?;
    let _ = std::fs::remove_file(&config.drain_sentinel);
    println!("Run state cleared. The next run starts from the beginning.");
    Ok(())
}
