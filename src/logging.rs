//! Tracing setup for the orchestrator and the sidecar.
//!
//! Both read `RUST_LOG` and default to `autosdd=info` (`autosdd=debug` with
//! `--verbose`). The orchestrator logs compactly to stderr and, once the
//! project's log directory is known, to a daily-rolling `autosdd.log`. The
//! sidecar runs detached, so it logs only to `eval-sidecar.log`.
//!
//! The returned [`WorkerGuard`] must be held until exit or buffered lines
//! are lost.

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const ORCHESTRATOR_LOG: &str = "autosdd.log";
pub const SIDECAR_LOG: &str = "eval-sidecar.log";

fn filter(verbose: bool) -> EnvFilter {
    let default = if verbose {
        "autosdd=debug"
    } else {
        "autosdd=info"
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialise logging for CLI commands. With `log_dir`, lines are also
/// appended to `<log_dir>/autosdd.log.<date>`.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let (writer, guard) =
                tracing_appender::non_blocking(rolling::daily(dir, ORCHESTRATOR_LOG));
            tracing_subscriber::registry()
                .with(filter(verbose))
                .with(stderr_layer)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .context("Failed to initialise logging")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter(verbose))
                .with(stderr_layer)
                .try_init()
                .context("Failed to initialise logging")?;
            Ok(None)
        }
    }
}

/// Initialise logging for the detached sidecar process.
pub fn init_sidecar(log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(rolling::never(log_dir, SIDECAR_LOG));
    tracing_subscriber::registry()
        .with(filter(false))
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init()
        .context("Failed to initialise sidecar logging")?;
    Ok(guard)
}
