//! CLI command implementations.
//!
//! | Module    | Commands handled      |
//! |-----------|-----------------------|
//! | `run`     | `Run`                 |
//! | `state`   | `Order`, `Status`, `Reset` |
//! | `sidecar` | `Sidecar`, `Summary`  |

pub mod run;
pub mod sidecar;
pub mod state;

pub use run::cmd_run;
pub use sidecar::{cmd_sidecar, cmd_summary};
pub use state::{cmd_order, cmd_reset, cmd_status};

use autosdd::agent::{Agent, ClaudeAgent};
use autosdd::config::Config;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// The agent CLI wrapper configured for this project.
pub fn project_agent(config: &Config) -> Arc<dyn Agent> {
    Arc::new(
        ClaudeAgent::new(&config.agent_cmd, config.agent_timeout)
            .with_flags(config.agent_flags.clone())
            .with_skip_permissions(config.skip_permissions),
    )
}

/// Cancel `cancel` on the first SIGINT or SIGTERM.
pub async fn cancel_on_signal(cancel: CancellationToken) {
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(term) => Some(term),
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            None
        }
    };
    let terminate = async {
        match term.as_mut() {
            Some(term) => {
                term.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
        }
        _ = terminate => {}
        _ = cancel.cancelled() => return,
    }
    warn!("Interrupt received, stopping after the current step");
    cancel.cancel();
}
