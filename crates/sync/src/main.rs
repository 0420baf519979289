// tetherd: standalone session sync daemon.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tether_sync::config::TetherConfig;
use tether_sync::runtime::{self, DaemonPaths};
use tracing::info;

#[derive(Parser)]
#[command(name = "tetherd", about = "Sync local agent sessions to the session store")]
struct Cli {
    /// Config file (defaults to `~/.tether/config.toml`).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Data root holding `tasks/` and `state/`.
    #[arg(long)]
    root: Option<PathBuf>,
    /// Repository whose working-tree state is attached to sessions.
    #[arg(long)]
    repo: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => TetherConfig::load_from(path)
            .with_context(|| format!("failed to load config `{}`", path.display()))?,
        None => TetherConfig::load(),
    };
    let paths = DaemonPaths::resolve(cli.root, &config)?;
    let repo = match cli.repo {
        Some(repo) => Some(repo),
        None => std::env::current_dir().ok(),
    };

    info!(data_root = %paths.data_root.display(), "starting tether sync daemon");
    runtime::run_standalone(config, paths, repo)
        .await
        .context("sync daemon terminated unexpectedly")
}
