// Session sync service: drains the sync queue into session-store RPCs.
//
// One pass runs at a time per process. Non-forced callers join the pass in
// flight; a forced call starts a new pass while the old one finishes on its
// own. Work for a single task is serialized by a per-task async mutex, so a
// forced pass and a regular pass never create two sessions for one task.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use tether_common::events::SyncEvent;
use tether_common::protocol::api::{CreateSessionRequest, UpdateSessionRequest};
use tether_common::types::{BlobKind, GitStateSnapshot, RemoteSession};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{SessionSyncError, SessionSyncResult};
use crate::git::{state_hash, GitStateService};
use crate::persistence::LocalPersistence;
use crate::queue::{FileChange, Stamp, SyncQueue};
use crate::security::CredentialSource;
use crate::state::SessionStateStore;
use crate::task_data::{TaskContext, TaskDataProvider};
use crate::title::SessionTitleService;
use crate::token_cache::TokenValidationCache;
use crate::transport::{SessionTransport, TransportError};

/// Kill-switch: any of `1`, `true`, `yes` disables session sync.
pub const DISABLE_SYNC_ENV_VAR: &str = "TETHER_DISABLE_SESSION_SYNC";

// ── Settings and collaborators ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Platform name recorded on created sessions (`vscode`, `cli`, ...).
    pub platform: String,
    /// Client version recorded on created sessions.
    pub version: String,
    pub organization_id: Option<String>,
    pub enabled: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            platform: "cli".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            organization_id: None,
            enabled: true,
        }
    }
}

impl SyncSettings {
    /// True when sync is switched off by config or by the environment.
    pub fn kill_switch_engaged(&self) -> bool {
        !self.enabled || env_flag_set(std::env::var(DISABLE_SYNC_ENV_VAR).ok().as_deref())
    }
}

fn env_flag_set(value: Option<&str>) -> bool {
    value.is_some_and(|value| {
        matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
    })
}

/// Per-task async mutexes shared by sync passes and lifecycle operations.
#[derive(Debug, Default)]
pub struct TaskLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TaskLocks {
    pub fn lock_for(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(task_id.to_string()).or_default().clone()
    }
}

/// Everything a sync pass talks to.
#[derive(Clone)]
pub struct SyncDeps {
    pub transport: Arc<dyn SessionTransport>,
    pub persistence: Arc<dyn LocalPersistence>,
    pub task_data: Arc<dyn TaskDataProvider>,
    pub credentials: Arc<dyn CredentialSource>,
    pub state: Arc<SessionStateStore>,
    pub git: Arc<GitStateService>,
    pub titles: Arc<SessionTitleService>,
    pub token_cache: Arc<TokenValidationCache>,
    pub task_locks: Arc<TaskLocks>,
    pub events: broadcast::Sender<SyncEvent>,
    pub settings: SyncSettings,
}

impl SyncDeps {
    pub(crate) fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// ── Pass handle ─────────────────────────────────────────────────────

/// How a pass ended. Passes never fail; errors are logged per task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    EmptyQueue,
    /// Kill-switch engaged; queued items were dropped.
    Disabled { dropped: usize },
    NoCredential,
    InvalidCredential,
    CredentialCheckFailed,
    Completed { tasks: usize, failed: usize },
    /// The pass task panicked or was cancelled.
    Aborted,
}

/// Handle to a sync pass. Clones share the same underlying pass.
#[derive(Clone)]
pub struct SyncPass {
    id: u64,
    future: Shared<BoxFuture<'static, PassOutcome>>,
}

impl SyncPass {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(&self) -> PassOutcome {
        self.future.clone().await
    }
}

impl std::fmt::Debug for SyncPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPass").field("id", &self.id).finish_non_exhaustive()
    }
}

// ── Service ─────────────────────────────────────────────────────────

pub struct SessionSyncService {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    deps: SyncDeps,
    queue: Mutex<SyncQueue>,
    in_flight: Mutex<Option<SyncPass>>,
    next_pass_id: AtomicU64,
}

struct GitCapture {
    remote_url: Option<String>,
    hash: String,
    encoded: Vec<u8>,
}

struct UploadResult {
    kind: BlobKind,
    upload_stamp: Stamp,
    outcome: Result<Option<Uploaded>, SessionSyncError>,
}

struct Uploaded {
    updated_at: DateTime<Utc>,
    /// Kept only for the conversation blob, which seeds title generation.
    content: Option<Vec<u8>>,
}

impl SessionSyncService {
    pub fn new(deps: SyncDeps) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                deps,
                queue: Mutex::new(SyncQueue::new()),
                in_flight: Mutex::new(None),
                next_pass_id: AtomicU64::new(1),
            }),
        }
    }

    /// Queue a local file change. Returns the enqueue stamp, or `None` if rejected.
    pub fn record_file_change(&self, change: FileChange) -> Option<Stamp> {
        let stamp = self.inner.queue().enqueue(change.clone());
        if stamp.is_some() {
            debug!(task_id = %change.task_id, kind = %change.blob_kind, "file change queued");
        }
        stamp
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue().len()
    }

    /// Tasks with queued items, in first-enqueue order.
    pub fn queued_task_ids(&self) -> Vec<String> {
        self.inner.queue().unique_task_ids()
    }

    /// Start a pass, or join the one in flight unless `force` is set.
    /// Must be called from within a tokio runtime.
    pub fn sync(&self, force: bool) -> SyncPass {
        let mut slot = self.inner.slot();
        if !force {
            if let Some(pass) = slot.as_ref() {
                debug!(pass_id = pass.id, "joining in-flight sync pass");
                return pass.clone();
            }
        }

        let id = self.inner.next_pass_id.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let outcome = inner.run_pass(id).await;
            let mut slot = inner.slot();
            if slot.as_ref().is_some_and(|pass| pass.id == id) {
                *slot = None;
            }
            outcome
        });

        let future = async move {
            handle.await.unwrap_or_else(|error| {
                warn!(pass_id = id, error = %error, "sync pass aborted");
                PassOutcome::Aborted
            })
        }
        .boxed()
        .shared();

        let pass = SyncPass { id, future };
        *slot = Some(pass.clone());
        pass
    }

    /// Pass currently in flight, if any.
    pub fn in_flight(&self) -> Option<SyncPass> {
        self.inner.slot().clone()
    }
}

impl SyncInner {
    fn queue(&self) -> MutexGuard<'_, SyncQueue> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self) -> MutexGuard<'_, Option<SyncPass>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_pass(&self, pass_id: u64) -> PassOutcome {
        if self.queue().is_empty() {
            return PassOutcome::EmptyQueue;
        }

        if self.deps.settings.kill_switch_engaged() {
            let dropped = self.queue().clear();
            info!(pass_id, dropped, "session sync disabled; dropped queued changes");
            return PassOutcome::Disabled { dropped };
        }

        let token = self.deps.credentials.get_token();
        match self.deps.token_cache.is_valid(token.as_deref(), self.deps.transport.as_ref()).await {
            Ok(None) => {
                debug!(pass_id, "no credential; leaving queue for a later pass");
                return PassOutcome::NoCredential;
            }
            Ok(Some(false)) => {
                info!(pass_id, "credential rejected by session store; skipping sync");
                return PassOutcome::InvalidCredential;
            }
            Ok(Some(true)) => {}
            Err(error) => {
                warn!(pass_id, error = %error, "credential check failed; skipping sync");
                self.deps.token_cache.invalidate();
                return PassOutcome::CredentialCheckFailed;
            }
        }

        let git = self.capture_git_state().await;

        let task_ids = self.queue().unique_task_ids();
        let mut last_session_id = None;
        let mut failed = 0;
        for task_id in &task_ids {
            let lock = self.deps.task_locks.lock_for(task_id);
            let _guard = lock.lock().await;
            let mut resolved = None;
            let result = self.process_task(task_id, git.as_ref(), &mut resolved).await;
            if resolved.is_some() {
                last_session_id = resolved;
            }
            if let Err(error) = result {
                failed += 1;
                warn!(pass_id, task_id = %task_id, error = %error, "task sync failed");
            }
        }

        if let Some(session_id) = last_session_id {
            if let Err(error) = self.deps.persistence.set_last_session_id(&session_id) {
                failed += 1;
                warn!(pass_id, error = %error, "failed to persist last active session");
            }
        }

        if failed > 0 {
            self.deps.token_cache.invalidate();
        }

        debug!(pass_id, tasks = task_ids.len(), failed, "sync pass finished");
        PassOutcome::Completed { tasks: task_ids.len(), failed }
    }

    async fn capture_git_state(&self) -> Option<GitCapture> {
        if !self.deps.git.is_enabled() {
            return None;
        }
        let git = Arc::clone(&self.deps.git);
        let snapshot = match tokio::task::spawn_blocking(move || git.capture_state()).await {
            Ok(snapshot) => snapshot?,
            Err(error) => {
                warn!(error = %error, "git state capture aborted");
                return None;
            }
        };
        encode_git_state(&snapshot)
    }

    /// Sync one task. `resolved` receives the task's session id as soon as
    /// it is known, so a later failure still reports which session was used.
    async fn process_task(
        &self,
        task_id: &str,
        git: Option<&GitCapture>,
        resolved: &mut Option<String>,
    ) -> SessionSyncResult<()> {
        let context = self.deps.task_data.task_context(task_id);
        let git_url = git.and_then(|capture| capture.remote_url.clone());

        let (session_id, created) = match self.deps.persistence.session_for_task(task_id)? {
            Some(session_id) => (session_id, false),
            None => {
                let request = CreateSessionRequest {
                    platform: self.deps.settings.platform.clone(),
                    version: self.deps.settings.version.clone(),
                    title: None,
                    git_url: git_url.clone(),
                    organization_id: self.deps.settings.organization_id.clone(),
                    last_mode: context.mode.clone(),
                    last_model: context.model.clone(),
                };
                let created = self.deps.transport.create(request).await?;
                if created.session_id.trim().is_empty() {
                    warn!(task_id, "session store returned no session id; skipping task");
                    return Ok(());
                }
                self.register_created(task_id, &created)?;
                (created.session_id, true)
            }
        };

        *resolved = Some(session_id.clone());
        let mark_before = self.deps.state.high_water_mark(&session_id);

        if !created {
            self.ensure_session_state(&session_id).await?;
            let drift = self.detect_drift(&session_id, git_url.as_deref(), &context);
            if !drift.is_empty() {
                debug!(task_id, session_id = %session_id, ?drift, "session fields drifted");
                let fields = drift.clone();
                let updated = self.deps.transport.update(&session_id, drift).await?;
                self.deps.state.record_fields(
                    &session_id,
                    fields.git_url.as_deref(),
                    fields.last_mode.as_deref(),
                    fields.last_model.as_deref(),
                );
                self.deps.state.advance_high_water_mark(&session_id, updated.updated_at);
            }
        }

        let mut first_error = None;
        let results = self.upload_queued_blobs(task_id, &session_id).await;
        for result in results {
            match result.outcome {
                Ok(Some(uploaded)) => {
                    self.deps.state.advance_high_water_mark(&session_id, uploaded.updated_at);
                    self.queue().remove_processed_items(task_id, result.kind, result.upload_stamp);
                    if let Some(content) = uploaded.content {
                        self.maybe_spawn_title(&session_id, content);
                    }
                }
                Ok(None) => {
                    self.queue().remove_processed_items(task_id, result.kind, result.upload_stamp);
                }
                Err(error) => {
                    warn!(task_id, kind = %result.kind, error = %error, "blob upload failed; keeping queued");
                    first_error.get_or_insert(error);
                }
            }
        }

        if let Some(capture) = git {
            if let Err(error) = self.upload_git_state(task_id, &session_id, capture).await {
                warn!(task_id, error = %error, "git state upload failed");
                first_error.get_or_insert(error.into());
            }
        }

        let mark_after = self.deps.state.high_water_mark(&session_id);
        if let Some(updated_at) = mark_after.filter(|after| Some(*after) != mark_before) {
            self.deps.emit(SyncEvent::SessionSynced {
                session_id: session_id.clone(),
                updated_at,
                timestamp: Utc::now(),
            });
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn register_created(&self, task_id: &str, created: &RemoteSession) -> SessionSyncResult<()> {
        self.deps.persistence.set_task_session(task_id, &created.session_id)?;
        self.deps.state.observe_remote(created);
        info!(task_id, session_id = %created.session_id, "session created");
        self.deps.emit(SyncEvent::SessionCreated {
            session_id: created.session_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Seed local state for a session first seen by this process.
    async fn ensure_session_state(&self, session_id: &str) -> SessionSyncResult<()> {
        if self.deps.state.contains(session_id) {
            return Ok(());
        }
        let remote = self
            .deps
            .transport
            .get(session_id, false)
            .await
            .map_err(|error| SessionSyncError::from_lookup(session_id, error))?;
        self.deps.state.observe_remote(&remote);
        Ok(())
    }

    fn detect_drift(
        &self,
        session_id: &str,
        git_url: Option<&str>,
        context: &TaskContext,
    ) -> UpdateSessionRequest {
        let known = self.deps.state.snapshot(session_id).unwrap_or_default();
        let changed = |current: Option<&str>, known: &Option<String>| {
            current.filter(|value| known.as_deref() != Some(*value)).map(str::to_string)
        };
        UpdateSessionRequest {
            title: None,
            git_url: changed(git_url, &known.git_url),
            last_mode: changed(context.mode.as_deref(), &known.mode),
            last_model: changed(context.model.as_deref(), &known.model),
        }
    }

    async fn upload_queued_blobs(&self, task_id: &str, session_id: &str) -> Vec<UploadResult> {
        let pending: Vec<_> = {
            let queue = self.queue();
            queue
                .blob_kinds_for_task(task_id)
                .into_iter()
                .filter_map(|kind| {
                    queue.last_item_for_blob(task_id, kind).map(|item| (kind, item.content_ref.clone()))
                })
                .collect()
        };

        let uploads = pending.into_iter().map(|(kind, path)| async move {
            let upload_stamp = self.queue().now();
            let outcome = self.upload_file(session_id, kind, &path).await;
            UploadResult { kind, upload_stamp, outcome }
        });
        join_all(uploads).await
    }

    /// `Ok(None)` when the file is gone; the queued items are then obsolete.
    async fn upload_file(
        &self,
        session_id: &str,
        kind: BlobKind,
        path: &Path,
    ) -> SessionSyncResult<Option<Uploaded>> {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                warn!(session_id, kind = %kind, path = %path.display(), "queued file no longer exists");
                return Ok(None);
            }
            Err(error) => {
                return Err(anyhow::Error::new(error)
                    .context(format!("failed to read `{}`", path.display()))
                    .into());
            }
        };

        let keep = (kind == BlobKind::Conversation).then(|| content.clone());
        let response = self.deps.transport.upload_blob(session_id, kind, content).await?;
        debug!(session_id, kind = %kind, "blob uploaded");
        Ok(Some(Uploaded { updated_at: response.updated_at, content: keep }))
    }

    async fn upload_git_state(
        &self,
        task_id: &str,
        session_id: &str,
        capture: &GitCapture,
    ) -> Result<(), TransportError> {
        if self.deps.state.git_hash_for_task(task_id).as_deref() == Some(capture.hash.as_str()) {
            return Ok(());
        }
        let response = self
            .deps
            .transport
            .upload_blob(session_id, BlobKind::GitState, capture.encoded.clone())
            .await?;
        self.deps.state.set_git_hash_for_task(task_id, capture.hash.clone());
        self.deps.state.advance_high_water_mark(session_id, response.updated_at);
        debug!(task_id, session_id, "git state uploaded");
        Ok(())
    }

    fn maybe_spawn_title(&self, session_id: &str, transcript: Vec<u8>) {
        if !self.deps.state.needs_title(session_id) {
            return;
        }
        let titles = Arc::clone(&self.deps.titles);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = titles.generate_and_update_title(&session_id, &transcript).await {
                warn!(session_id = %session_id, error = %error, "title generation failed");
            }
        });
    }
}

fn encode_git_state(snapshot: &GitStateSnapshot) -> Option<GitCapture> {
    match serde_json::to_vec(snapshot) {
        Ok(encoded) => Some(GitCapture {
            remote_url: snapshot.remote_url.clone(),
            hash: state_hash(snapshot),
            encoded,
        }),
        Err(error) => {
            warn!(error = %error, "failed to encode git state");
            None
        }
    }
}
