// Session lifecycle: operations the host triggers directly, outside sync
// passes. Restore pulls a remote session into a fresh local task, including
// its working-tree state.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::Utc;
use futures_util::future::join_all;
use tether_common::events::SyncEvent;
use tether_common::protocol::api::{
    CreateSessionRequest, ForkSessionRequest, ShareSessionResponse, UpdateSessionRequest,
};
use tether_common::types::{BlobKind, GitStateSnapshot, RemoteSession, Visibility};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{SessionSyncError, SessionSyncResult};
use crate::messenger::{ExtensionMessenger, HostMessage};
use crate::sync::SyncDeps;
use crate::task_data::{TaskFiles, TaskRecord};
use crate::title::derive_title_locally;
use crate::transcript::{first_utterance, strip_checkpoint_entries};

/// A remote session materialized as a local task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredSession {
    pub session_id: String,
    pub task_id: String,
}

pub struct SessionLifecycleService {
    deps: SyncDeps,
    messenger: Arc<dyn ExtensionMessenger>,
}

impl SessionLifecycleService {
    pub fn new(deps: SyncDeps, messenger: Arc<dyn ExtensionMessenger>) -> Self {
        Self { deps, messenger }
    }

    fn require_credentials(&self) -> SessionSyncResult<()> {
        match self.deps.credentials.get_token() {
            Some(token) if !token.trim().is_empty() => Ok(()),
            _ => Err(SessionSyncError::Uninitialized("session store credentials")),
        }
    }

    /// Mapped session for `task_id`, creating one (with a title and the
    /// initial conversation and transcript blobs) when the task has none.
    pub async fn get_or_create_session_for_task(&self, task_id: &str) -> SessionSyncResult<String> {
        let lock = self.deps.task_locks.lock_for(task_id);
        let _guard = lock.lock().await;

        if let Some(session_id) = self.deps.persistence.session_for_task(task_id)? {
            return Ok(session_id);
        }
        self.require_credentials()?;

        let files = self.deps.task_data.task_files(task_id);
        let conversation = read_optional(&files, BlobKind::Conversation).await?;
        let transcript = read_optional(&files, BlobKind::Transcript).await?;
        let title = conversation
            .as_deref()
            .and_then(first_utterance)
            .or_else(|| transcript.as_deref().and_then(first_utterance))
            .map(|utterance| derive_title_locally(&utterance));

        let context = self.deps.task_data.task_context(task_id);
        let git = Arc::clone(&self.deps.git);
        let git_url = tokio::task::spawn_blocking(move || git.remote_url()).await.unwrap_or(None);

        let request = CreateSessionRequest {
            platform: self.deps.settings.platform.clone(),
            version: self.deps.settings.version.clone(),
            title: title.clone(),
            git_url,
            organization_id: self.deps.settings.organization_id.clone(),
            last_mode: context.mode,
            last_model: context.model,
        };
        let created = self.deps.transport.create(request).await?;
        let session_id = created.session_id.clone();
        if session_id.trim().is_empty() {
            return Err(anyhow!("session store returned no session id for task `{task_id}`").into());
        }
        self.deps.state.observe_remote(&created);

        let uploads = [(BlobKind::Conversation, conversation), (BlobKind::Transcript, transcript)]
            .into_iter()
            .filter_map(|(kind, content)| content.map(|content| (kind, content)))
            .map(|(kind, content)| {
                let session_id = session_id.as_str();
                async move { (kind, self.deps.transport.upload_blob(session_id, kind, content).await) }
            });
        for (kind, result) in join_all(uploads).await {
            let response = result?;
            self.deps.state.advance_high_water_mark(&session_id, response.updated_at);
            info!(task_id, session_id = %session_id, kind = %kind, "initial blob uploaded");
        }

        self.deps.persistence.set_task_session(task_id, &session_id)?;
        if let Some(title) = title {
            self.deps.state.set_title(&session_id, title);
        }
        self.deps.emit(SyncEvent::SessionCreated { session_id: session_id.clone(), timestamp: Utc::now() });
        info!(task_id, session_id = %session_id, "session created for task");
        Ok(session_id)
    }

    /// Pull `session_id` into a new local task.
    ///
    /// Failures are logged and yield `Ok(None)` unless `rethrow` is set.
    pub async fn restore_session(
        &self,
        session_id: &str,
        rethrow: bool,
    ) -> SessionSyncResult<Option<RestoredSession>> {
        match self.restore(session_id).await {
            Ok(restored) => Ok(Some(restored)),
            Err(error) if rethrow => Err(error),
            Err(error) => {
                warn!(session_id, error = %error, "session restore failed");
                Ok(None)
            }
        }
    }

    /// Restore the persisted last active session. Never fails.
    pub async fn restore_last_session(&self) -> bool {
        let session_id = match self.deps.persistence.last_session_id() {
            Ok(Some(session_id)) => session_id,
            Ok(None) => return false,
            Err(error) => {
                warn!(error = %error, "failed to read last active session");
                return false;
            }
        };
        matches!(self.restore_session(&session_id, false).await, Ok(Some(_)))
    }

    /// Publish a session. Defaults to the last active session.
    pub async fn share_session(&self, session_id: Option<&str>) -> SessionSyncResult<ShareSessionResponse> {
        let session_id = match session_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(session_id) => session_id.to_string(),
            None => self.deps.persistence.last_session_id()?.ok_or(SessionSyncError::NoActiveSession)?,
        };
        self.require_credentials()?;

        let response = self
            .deps
            .transport
            .share(&session_id, Visibility::Public)
            .await
            .map_err(|error| SessionSyncError::from_lookup(&session_id, error))?;
        info!(session_id = %session_id, share_id = %response.share_id, "session shared");
        self.messenger.send_message(HostMessage::SessionShared {
            session_id: response.session_id.clone(),
            share_id: response.share_id.clone(),
        });
        Ok(response)
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> SessionSyncResult<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SessionSyncError::EmptyTitle);
        }
        self.require_credentials()?;

        let request = UpdateSessionRequest { title: Some(title.to_string()), ..Default::default() };
        let updated = self
            .deps
            .transport
            .update(session_id, request)
            .await
            .map_err(|error| SessionSyncError::from_lookup(session_id, error))?;
        self.deps.state.set_title(session_id, title);
        self.deps.state.advance_high_water_mark(session_id, updated.updated_at);
        info!(session_id, "session renamed");
        Ok(())
    }

    /// Fork a shared or owned session and restore the fork locally.
    pub async fn fork_session(&self, share_or_session_id: &str) -> SessionSyncResult<RestoredSession> {
        self.require_credentials()?;
        let request = ForkSessionRequest {
            share_or_session_id: share_or_session_id.to_string(),
            platform: self.deps.settings.platform.clone(),
        };
        let forked = self
            .deps
            .transport
            .fork(request)
            .await
            .map_err(|error| SessionSyncError::from_lookup(share_or_session_id, error))?;
        info!(source = share_or_session_id, session_id = %forked.session_id, "session forked");

        self.restore_session(&forked.session_id, true)
            .await?
            .ok_or_else(|| SessionSyncError::SessionNotFound(forked.session_id))
    }

    async fn restore(&self, session_id: &str) -> SessionSyncResult<RestoredSession> {
        self.require_credentials()?;
        let remote = self
            .deps
            .transport
            .get(session_id, true)
            .await
            .map_err(|error| SessionSyncError::from_lookup(session_id, error))?;

        let task_id = Uuid::new_v4().to_string();
        let files = self.deps.task_data.ensure_task_dir(&task_id)?;
        let git_state = match self.write_task_blobs(&remote, &files).await {
            Ok(git_state) => git_state,
            Err(error) => {
                if let Err(cleanup) = self.deps.task_data.remove_task_dir(&task_id) {
                    warn!(task_id = %task_id, error = %cleanup, "failed to remove partially restored task");
                }
                return Err(error);
            }
        };
        if let Some(encoded) = git_state {
            self.restore_git_state(session_id, &encoded).await;
        }

        self.deps.task_data.register_task(TaskRecord {
            task_id: task_id.clone(),
            title: remote.existing_title().map(str::to_string),
            session_id: Some(session_id.to_string()),
            registered_at: Utc::now(),
        })?;
        if let Some(previous) = self.deps.persistence.task_for_session(session_id)? {
            info!(session_id, previous_task = %previous, task_id = %task_id, "moving session mapping to restored task");
        }
        self.deps.persistence.set_task_session(&task_id, session_id)?;
        self.deps.persistence.set_last_session_id(session_id)?;
        self.deps.state.observe_remote(&remote);

        self.messenger.send_message(HostMessage::ShowTask { task_id: task_id.clone() });
        self.deps.emit(SyncEvent::SessionRestored);
        info!(session_id, task_id = %task_id, "session restored");

        Ok(RestoredSession { session_id: session_id.to_string(), task_id })
    }

    /// Write the queueable blobs into `files` and fetch the encoded git state.
    async fn write_task_blobs(
        &self,
        remote: &RemoteSession,
        files: &TaskFiles,
    ) -> SessionSyncResult<Option<Vec<u8>>> {
        for kind in BlobKind::QUEUEABLE {
            self.restore_blob(remote, kind, files).await?;
        }
        match remote.blob_urls.get(BlobKind::GitState) {
            Some(url) => Ok(Some(self.deps.transport.fetch_blob(url).await?)),
            None => Ok(None),
        }
    }

    async fn restore_blob(
        &self,
        remote: &RemoteSession,
        kind: BlobKind,
        files: &TaskFiles,
    ) -> SessionSyncResult<()> {
        let (Some(url), Some(path)) = (remote.blob_urls.get(kind), files.path_for(kind)) else {
            return Ok(());
        };

        let mut content = self.deps.transport.fetch_blob(url).await?;
        if kind == BlobKind::Transcript {
            let (filtered, removed) = strip_checkpoint_entries(&content);
            if removed > 0 {
                info!(session_id = %remote.session_id, removed, "dropped checkpoint entries from transcript");
            }
            content = filtered;
        }

        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("failed to write `{}`", path.display()))?;
        Ok(())
    }

    async fn restore_git_state(&self, session_id: &str, encoded: &[u8]) {
        let snapshot: GitStateSnapshot = match serde_json::from_slice(encoded) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(session_id, error = %error, "git state blob is not valid JSON; skipping");
                return;
            }
        };

        let git = Arc::clone(&self.deps.git);
        match tokio::task::spawn_blocking(move || git.restore(&snapshot)).await {
            Ok(report) if report.failed_steps > 0 => {
                warn!(session_id, failed_steps = report.failed_steps, "git state partially restored");
            }
            Ok(report) => info!(session_id, checkout = ?report.checkout, "git state restored"),
            Err(error) => warn!(session_id, error = %error, "git state restore aborted"),
        }
    }
}

async fn read_optional(files: &TaskFiles, kind: BlobKind) -> SessionSyncResult<Option<Vec<u8>>> {
    let Some(path) = files.path_for(kind) else {
        return Ok(None);
    };
    match tokio::fs::read(path).await {
        Ok(content) => Ok(Some(content)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(error) => {
            Err(anyhow::Error::new(error).context(format!("failed to read `{}`", path.display())).into())
        }
    }
}
