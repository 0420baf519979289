// Standalone runtime: watcher → engine → scheduler, until shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::TetherConfig;
use crate::engine::Engine;
use crate::git::GitStateService;
use crate::messenger::LoggingMessenger;
use crate::persistence::sqlite::SqlitePersistence;
use crate::scheduler::SchedulerConfig;
use crate::security::{ensure_owner_only_dir, CredentialSource, KeyringCredentialSource};
use crate::task_data::FsTaskDataProvider;
use crate::transport::http::HttpSessionTransport;
use crate::watcher::TaskWatcher;

const STATE_DB_FILE: &str = "sync.db";

/// Where the daemon keeps its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub data_root: PathBuf,
    pub state_db: PathBuf,
}

impl DaemonPaths {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        let state_db = data_root.join("state").join(STATE_DB_FILE);
        Self { data_root, state_db }
    }

    /// `--root`, else `workspace_root` from config, else `~/.tether`.
    pub fn resolve(root: Option<PathBuf>, config: &TetherConfig) -> Result<Self> {
        root.or_else(|| config.data_root())
            .map(Self::new)
            .ok_or_else(|| anyhow!("could not determine data root; pass --root"))
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub scheduler: SchedulerConfig,
    pub shutdown_timeout: Duration,
}

impl From<&TetherConfig> for RuntimeSettings {
    fn from(config: &TetherConfig) -> Self {
        Self { scheduler: config.scheduler_config(), shutdown_timeout: config.shutdown_timeout() }
    }
}

/// Engine backed by SQLite state, the HTTP session store and keychain credentials.
pub fn build_engine(config: &TetherConfig, paths: &DaemonPaths, repo: Option<PathBuf>) -> Result<Engine> {
    let api_url = config
        .api_url
        .as_deref()
        .ok_or_else(|| anyhow!("`api_url` is not configured"))?;

    std::fs::create_dir_all(&paths.data_root)
        .with_context(|| format!("failed to create data root `{}`", paths.data_root.display()))?;
    ensure_owner_only_dir(&paths.data_root)?;

    let credentials: Arc<dyn CredentialSource> = Arc::new(KeyringCredentialSource::new());
    let transport = HttpSessionTransport::new(api_url, Arc::clone(&credentials))?;
    let persistence = SqlitePersistence::open(&paths.state_db)?;
    let task_data = FsTaskDataProvider::new(&paths.data_root);

    Ok(Engine::builder(Arc::new(transport), Arc::new(persistence), Arc::new(task_data), credentials)
        .messenger(Arc::new(LoggingMessenger))
        .git(GitStateService::new(repo))
        .settings(config.sync_settings())
        .completion_timeout(config.completion_timeout())
        .build())
}

pub async fn run_standalone(config: TetherConfig, paths: DaemonPaths, repo: Option<PathBuf>) -> Result<()> {
    let engine = Arc::new(build_engine(&config, &paths, repo)?);

    let (shutdown_tx, _) = broadcast::channel(4);
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = ctrl_c_tx.send(());
    });

    info!(data_root = %paths.data_root.display(), "standalone sync daemon started");
    run_until_shutdown(engine, &paths.data_root, RuntimeSettings::from(&config), shutdown_tx).await
}

/// Feed watcher changes into `engine` until `shutdown` fires, then flush.
pub async fn run_until_shutdown(
    engine: Arc<Engine>,
    data_root: &Path,
    settings: RuntimeSettings,
    shutdown: broadcast::Sender<()>,
) -> Result<()> {
    let mut shutdown_rx = shutdown.subscribe();
    let (watcher, mut changes) = TaskWatcher::start(data_root)?;
    let scheduler = engine.start_scheduler(settings.scheduler.clone(), shutdown.subscribe());

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!("shutdown requested");
                break;
            }
            change = changes.recv() => match change {
                Some(change) => {
                    engine.record_file_change(change);
                }
                None => {
                    warn!("task watcher stopped unexpectedly");
                    break;
                }
            },
        }
    }

    drop(watcher);
    let _ = shutdown.send(());
    if let Err(error) = scheduler.await {
        warn!(error = %error, "sync scheduler task failed");
    }

    info!(pending = engine.sync_service().queue_len(), "flushing session sync before exit");
    engine.shutdown(settings.shutdown_timeout).await;
    Ok(())
}
