//! devhelm - terminal dashboard for local dev processes.
//!
//! This entry point owns the supervisor runtime: it prepares the config
//! directories, reattaches to sessions that survived the previous run,
//! and keeps the supervisor resident until interrupted. Managed children
//! are left running on exit; the next run picks them up again through
//! the session store.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use devhelm_core::config::{self, LocalConfig};
use devhelm_core::ProcessManager;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "devhelm")]
#[command(about = "Dashboard for local dev processes: spawn, supervise, reattach")]
#[command(version, disable_version_flag = true)]
#[command(after_help = "\
Configuration:
  Config file:  ~/.config/devhelm/config.json
  Sessions dir: ~/.config/devhelm/sessions/
  Logs dir:     ~/.config/devhelm/logs/

Processes are spawned in the background and persist after quitting.
Re-running devhelm reconnects to existing processes.")]
struct Args {
    /// Print version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let _args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cfg = LocalConfig::load();
    if !config::config_path().exists() {
        cfg.save().context("writing default config")?;
    }

    let sessions_dir = config::sessions_dir();
    let logs_dir = config::logs_dir();
    for dir in [&sessions_dir, &logs_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating directory {}", dir.display()))?;
    }

    let manager = ProcessManager::new(sessions_dir, logs_dir);

    let reattached = manager.reconnect().await;
    if !reattached.is_empty() {
        eprintln!("Reconnected to {} existing process(es)", reattached.len());
    }
    for process in &reattached {
        info!(name = %process.info.name, pid = process.info.pid, "session reattached");
    }

    // The dashboard front-end drives the manager from here on. Quitting
    // leaves children running; the next run reattaches them.
    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("interrupted, leaving managed processes running");
    Ok(())
}
