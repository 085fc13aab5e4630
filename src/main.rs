use anyhow::{Context, Result};
use autosdd::errors::exit_code_for;
use autosdd::project_config::BranchStrategy;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "autosdd")]
#[command(version, about = "Builds a feature roadmap with an AI coding agent, one validated feature at a time")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build every pending roadmap feature in dependency order
    Run {
        /// Branch strategy: chained, independent or sequential
        #[arg(long)]
        strategy: Option<BranchStrategy>,

        /// Retries per feature after the first attempt
        #[arg(long)]
        max_retries: Option<u32>,

        /// Do not start the evaluation sidecar
        #[arg(long)]
        no_sidecar: bool,
    },
    /// Print the build order of pending features
    Order,
    /// Show the saved resume state
    Status,
    /// Delete the resume state so the next run starts over
    Reset {
        /// Reset even while another run holds the lock
        #[arg(long)]
        force: bool,
    },
    /// Aggregate existing evaluation results into a campaign summary
    Summary,
    /// Background evaluation loop (started by `run`)
    #[command(hide = true)]
    Sidecar,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = dispatch(&cli) {
        eprintln!("{} {e:#}", console::style("error:").red().bold());
        std::process::exit(exit_code_for(&e));
    }
}

fn dispatch(cli: &Cli) -> Result<()> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Order => cmd::cmd_order(&project_dir, cli.verbose),
        Commands::Status => cmd::cmd_status(&project_dir, cli.verbose),
        Commands::Reset { force } => cmd::cmd_reset(&project_dir, cli.verbose, *force),
        Commands::Summary => cmd::cmd_summary(&project_dir, cli.verbose),
        Commands::Run {
            strategy,
            max_retries,
            no_sidecar,
        } => {
            let overrides = autosdd::config::CliOverrides {
                strategy: *strategy,
                max_retries: *max_retries,
                no_sidecar: *no_sidecar,
            };
            runtime()?.block_on(cmd::cmd_run(&project_dir, cli.verbose, &overrides))
        }
        Commands::Sidecar => runtime()?.block_on(cmd::cmd_sidecar(&project_dir, cli.verbose)),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}
