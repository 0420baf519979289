// Engine assembly: wires the sync, title and lifecycle services onto one
// shared set of collaborators and owns the shutdown flush.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether_common::events::SyncEvent;
use tether_common::protocol::api::ShareSessionResponse;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::SessionSyncResult;
use crate::git::GitStateService;
use crate::lifecycle::{RestoredSession, SessionLifecycleService};
use crate::messenger::{ExtensionMessenger, LoggingMessenger};
use crate::persistence::LocalPersistence;
use crate::queue::{FileChange, Stamp};
use crate::scheduler::{SchedulerConfig, SyncScheduler};
use crate::security::CredentialSource;
use crate::state::SessionStateStore;
use crate::sync::{PassOutcome, SessionSyncService, SyncDeps, SyncPass, SyncSettings, TaskLocks};
use crate::task_data::TaskDataProvider;
use crate::title::{SessionTitleService, DEFAULT_COMPLETION_TIMEOUT};
use crate::token_cache::TokenValidationCache;
use crate::transport::SessionTransport;

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct EngineBuilder {
    transport: Arc<dyn SessionTransport>,
    persistence: Arc<dyn LocalPersistence>,
    task_data: Arc<dyn TaskDataProvider>,
    credentials: Arc<dyn CredentialSource>,
    messenger: Arc<dyn ExtensionMessenger>,
    git: GitStateService,
    settings: SyncSettings,
    completion_timeout: Duration,
}

impl EngineBuilder {
    pub fn messenger(mut self, messenger: Arc<dyn ExtensionMessenger>) -> Self {
        self.messenger = messenger;
        self
    }

    pub fn git(mut self, git: GitStateService) -> Self {
        self.git = git;
        self
    }

    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn build(self) -> Engine {
        let state = Arc::new(SessionStateStore::new());
        let titles = SessionTitleService::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.messenger),
            Arc::clone(&state),
        )
        .with_completion_timeout(self.completion_timeout);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let deps = SyncDeps {
            transport: self.transport,
            persistence: self.persistence,
            task_data: self.task_data,
            credentials: self.credentials,
            state,
            git: Arc::new(self.git),
            titles: Arc::new(titles),
            token_cache: Arc::new(TokenValidationCache::new()),
            task_locks: Arc::new(TaskLocks::default()),
            events,
            settings: self.settings,
        };

        Engine {
            sync: Arc::new(SessionSyncService::new(deps.clone())),
            lifecycle: SessionLifecycleService::new(deps.clone(), self.messenger),
            deps,
            scheduler: Mutex::new(None),
        }
    }
}

/// The assembled sync engine. Hosts feed it file changes and call the
/// lifecycle operations; it reports progress through [`SyncEvent`]s.
pub struct Engine {
    deps: SyncDeps,
    sync: Arc<SessionSyncService>,
    lifecycle: SessionLifecycleService,
    scheduler: Mutex<Option<SyncScheduler>>,
}

impl Engine {
    pub fn builder(
        transport: Arc<dyn SessionTransport>,
        persistence: Arc<dyn LocalPersistence>,
        task_data: Arc<dyn TaskDataProvider>,
        credentials: Arc<dyn CredentialSource>,
    ) -> EngineBuilder {
        EngineBuilder {
            transport,
            persistence,
            task_data,
            credentials,
            messenger: Arc::new(LoggingMessenger),
            git: GitStateService::disabled(),
            settings: SyncSettings::default(),
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.deps.events.subscribe()
    }

    pub fn state(&self) -> &SessionStateStore {
        &self.deps.state
    }

    pub fn sync_service(&self) -> &Arc<SessionSyncService> {
        &self.sync
    }

    /// Start the debounce scheduler. Subsequent file changes are reported to it.
    pub fn start_scheduler(
        &self,
        config: SchedulerConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let (scheduler, handle) = SyncScheduler::spawn(Arc::clone(&self.sync), config, shutdown);
        *self.scheduler.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(scheduler);
        handle
    }

    pub fn record_file_change(&self, change: FileChange) -> Option<Stamp> {
        let stamp = self.sync.record_file_change(change)?;
        let scheduler = self.scheduler.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(scheduler) = scheduler.as_ref() {
            scheduler.notify(self.sync.queue_len());
        }
        Some(stamp)
    }

    pub fn sync(&self, force: bool) -> SyncPass {
        self.sync.sync(force)
    }

    pub async fn get_or_create_session_for_task(&self, task_id: &str) -> SessionSyncResult<String> {
        self.lifecycle.get_or_create_session_for_task(task_id).await
    }

    pub async fn restore_session(
        &self,
        session_id: &str,
        rethrow: bool,
    ) -> SessionSyncResult<Option<RestoredSession>> {
        self.lifecycle.restore_session(session_id, rethrow).await
    }

    pub async fn restore_last_session(&self) -> bool {
        self.lifecycle.restore_last_session().await
    }

    pub async fn share_session(&self, session_id: Option<&str>) -> SessionSyncResult<ShareSessionResponse> {
        self.lifecycle.share_session(session_id).await
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> SessionSyncResult<()> {
        self.lifecycle.rename_session(session_id, title).await
    }

    pub async fn fork_session(&self, share_or_session_id: &str) -> SessionSyncResult<RestoredSession> {
        self.lifecycle.fork_session(share_or_session_id).await
    }

    /// Run one final forced pass, waiting at most `timeout` for it.
    ///
    /// Returns `None` when the wait timed out; unsynced changes are then lost.
    pub async fn shutdown(&self, timeout: Duration) -> Option<PassOutcome> {
        let pending = self.sync.queue_len();
        let pass = self.sync.sync(true);
        match tokio::time::timeout(timeout, pass.wait()).await {
            Ok(outcome) => {
                info!(pass_id = pass.id(), ?outcome, "final sync pass finished");
                Some(outcome)
            }
            Err(_) => {
                warn!(
                    pass_id = pass.id(),
                    pending,
                    timeout_ms = timeout.as_millis() as u64,
                    "final sync pass did not settle; queued changes may be lost"
                );
                None
            }
        }
    }
}
