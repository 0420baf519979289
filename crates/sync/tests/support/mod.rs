// Shared fixtures for sync engine integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tether_common::protocol::api::{
    CreateSessionRequest, ForkSessionRequest, ForkSessionResponse, ShareSessionResponse,
    UpdateSessionRequest, UploadBlobResponse,
};
use tether_common::types::{BlobKind, BlobUrls, RemoteSession, Visibility};
use tether_sync::engine::{Engine, EngineBuilder};
use tether_sync::messenger::{CompletionError, CompletionFuture, ExtensionMessenger, HostMessage};
use tether_sync::persistence::MemoryPersistence;
use tether_sync::queue::FileChange;
use tether_sync::security::StaticCredentialSource;
use tether_sync::task_data::{FsTaskDataProvider, TaskDataProvider};
use tether_sync::transport::{SessionTransport, TransportError, TransportFuture};

// ── Mock transport ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(CreateSessionRequest),
    Get { session_id: String, include_blob_urls: bool },
    Update { session_id: String, request: UpdateSessionRequest },
    Share { session_id: String, visibility: Visibility },
    Fork(ForkSessionRequest),
    Upload { session_id: String, kind: BlobKind, content: Vec<u8> },
    FetchBlob(String),
    TokenValid,
}

impl Call {
    /// Calls that reach the session store, excluding the credential check.
    pub fn is_rpc(&self) -> bool {
        !matches!(self, Call::TokenValid)
    }
}

struct MockState {
    calls: Vec<Call>,
    sessions: HashMap<String, RemoteSession>,
    blobs: HashMap<String, Vec<u8>>,
    next_session: u32,
    clock: DateTime<Utc>,
    token_valid: bool,
    create_returns_empty_id: bool,
    fail_uploads: bool,
    failing_sessions: HashSet<String>,
    upload_delay: Option<Duration>,
}

/// In-memory session store that records every call.
pub struct MockTransport {
    state: StdMutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(MockState {
                calls: Vec::new(),
                sessions: HashMap::new(),
                blobs: HashMap::new(),
                next_session: 1,
                clock: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
                token_valid: true,
                create_returns_empty_id: false,
                fail_uploads: false,
                failing_sessions: HashSet::new(),
                upload_delay: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn rpc_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_rpc).collect()
    }

    pub fn creates(&self) -> Vec<CreateSessionRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Create(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn updates(&self) -> Vec<(String, UpdateSessionRequest)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Update { session_id, request } => Some((session_id, request)),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<(String, BlobKind, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Upload { session_id, kind, content } => Some((session_id, kind, content)),
                _ => None,
            })
            .collect()
    }

    pub fn uploads_of(&self, kind: BlobKind) -> usize {
        self.uploads().iter().filter(|(_, uploaded, _)| *uploaded == kind).count()
    }

    pub fn gets(&self) -> usize {
        self.calls().iter().filter(|call| matches!(call, Call::Get { .. })).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn set_token_valid(&self, valid: bool) {
        self.lock().token_valid = valid;
    }

    pub fn set_create_returns_empty_id(&self, empty: bool) {
        self.lock().create_returns_empty_id = empty;
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.lock().fail_uploads = fail;
    }

    /// Fail blob uploads and downloads for one session only.
    pub fn fail_session_blobs(&self, session_id: &str) {
        self.lock().failing_sessions.insert(session_id.to_string());
    }

    pub fn set_upload_delay(&self, delay: Duration) {
        self.lock().upload_delay = Some(delay);
    }

    pub fn session(&self, session_id: &str) -> Option<RemoteSession> {
        self.lock().sessions.get(session_id).cloned()
    }

    /// Store a session with the given blobs, as if uploaded by another client.
    pub fn seed_session(&self, session_id: &str, title: Option<&str>, blobs: &[(BlobKind, &[u8])]) {
        let mut state = self.lock();
        let now = tick(&mut state);
        let mut session = new_session(session_id, now);
        session.title = title.map(str::to_string);
        state.sessions.insert(session_id.to_string(), session);
        for (kind, content) in blobs {
            state.blobs.insert(blob_url(session_id, *kind), content.to_vec());
        }
    }

    pub fn blob(&self, session_id: &str, kind: BlobKind) -> Option<Vec<u8>> {
        self.lock().blobs.get(&blob_url(session_id, kind)).cloned()
    }
}

fn tick(state: &mut MockState) -> DateTime<Utc> {
    state.clock += chrono::Duration::seconds(1);
    state.clock
}

fn blob_url(session_id: &str, kind: BlobKind) -> String {
    format!("mock://blobs/{session_id}/{kind}")
}

fn new_session(session_id: &str, now: DateTime<Utc>) -> RemoteSession {
    RemoteSession {
        session_id: session_id.to_string(),
        title: None,
        created_at: now,
        updated_at: now,
        git_url: None,
        created_on_platform: "cli".to_string(),
        organization_id: None,
        last_mode: None,
        last_model: None,
        version: "0.1.0".to_string(),
        blob_urls: BlobUrls::default(),
    }
}

fn with_blob_urls(state: &MockState, mut session: RemoteSession) -> RemoteSession {
    let mut urls = BlobUrls::default();
    for kind in [BlobKind::Conversation, BlobKind::Transcript, BlobKind::Metadata, BlobKind::GitState] {
        let url = blob_url(&session.session_id, kind);
        if state.blobs.contains_key(&url) {
            match kind {
                BlobKind::Conversation => urls.conversation = Some(url),
                BlobKind::Transcript => urls.transcript = Some(url),
                BlobKind::Metadata => urls.metadata = Some(url),
                BlobKind::GitState => urls.git_state = Some(url),
            }
        }
    }
    session.blob_urls = urls;
    session
}

fn ready<'a, T: Send + 'a>(result: Result<T, TransportError>) -> TransportFuture<'a, T> {
    Box::pin(async move { result })
}

impl SessionTransport for MockTransport {
    fn create(&self, request: CreateSessionRequest) -> TransportFuture<'_, RemoteSession> {
        let mut state = self.lock();
        state.calls.push(Call::Create(request.clone()));
        let now = tick(&mut state);
        let session_id = if state.create_returns_empty_id {
            String::new()
        } else {
            let id = format!("session-{}", state.next_session);
            state.next_session += 1;
            id
        };
        let mut session = new_session(&session_id, now);
        session.title = request.title;
        session.git_url = request.git_url;
        session.organization_id = request.organization_id;
        session.last_mode = request.last_mode;
        session.last_model = request.last_model;
        session.created_on_platform = request.platform;
        session.version = request.version;
        if !session_id.is_empty() {
            state.sessions.insert(session_id, session.clone());
        }
        ready(Ok(session))
    }

    fn get(&self, session_id: &str, include_blob_urls: bool) -> TransportFuture<'_, RemoteSession> {
        let mut state = self.lock();
        state.calls.push(Call::Get { session_id: session_id.to_string(), include_blob_urls });
        let result = match state.sessions.get(session_id).cloned() {
            Some(session) if include_blob_urls => Ok(with_blob_urls(&state, session)),
            Some(session) => Ok(session),
            None => Err(TransportError::NotFound(format!("session {session_id}"))),
        };
        ready(result)
    }

    fn update(
        &self,
        session_id: &str,
        request: UpdateSessionRequest,
    ) -> TransportFuture<'_, RemoteSession> {
        let mut state = self.lock();
        state.calls.push(Call::Update { session_id: session_id.to_string(), request: request.clone() });
        let now = tick(&mut state);
        let result = match state.sessions.get_mut(session_id) {
            Some(session) => {
                if request.title.is_some() {
                    session.title = request.title;
                }
                if request.git_url.is_some() {
                    session.git_url = request.git_url;
                }
                if request.last_mode.is_some() {
                    session.last_mode = request.last_mode;
                }
                if request.last_model.is_some() {
                    session.last_model = request.last_model;
                }
                session.updated_at = now;
                Ok(session.clone())
            }
            None => Err(TransportError::NotFound(format!("session {session_id}"))),
        };
        ready(result)
    }

    fn share(&self, session_id: &str, visibility: Visibility) -> TransportFuture<'_, ShareSessionResponse> {
        let mut state = self.lock();
        state.calls.push(Call::Share { session_id: session_id.to_string(), visibility });
        let result = if state.sessions.contains_key(session_id) {
            Ok(ShareSessionResponse {
                share_id: format!("share-{session_id}"),
                session_id: session_id.to_string(),
            })
        } else {
            Err(TransportError::NotFound(format!("session {session_id}")))
        };
        ready(result)
    }

    fn fork(&self, request: ForkSessionRequest) -> TransportFuture<'_, ForkSessionResponse> {
        let mut state = self.lock();
        state.calls.push(Call::Fork(request.clone()));
        let source_id = request
            .share_or_session_id
            .strip_prefix("share-")
            .unwrap_or(&request.share_or_session_id)
            .to_string();
        let Some(source) = state.sessions.get(&source_id).cloned() else {
            return ready(Err(TransportError::NotFound(format!("session {source_id}"))));
        };

        let now = tick(&mut state);
        let forked_id = format!("session-{}", state.next_session);
        state.next_session += 1;
        let mut forked = new_session(&forked_id, now);
        forked.title = source.title;
        forked.created_on_platform = request.platform;
        state.sessions.insert(forked_id.clone(), forked);
        for kind in [BlobKind::Conversation, BlobKind::Transcript, BlobKind::Metadata, BlobKind::GitState] {
            if let Some(content) = state.blobs.get(&blob_url(&source_id, kind)).cloned() {
                state.blobs.insert(blob_url(&forked_id, kind), content);
            }
        }
        ready(Ok(ForkSessionResponse { session_id: forked_id }))
    }

    fn upload_blob(
        &self,
        session_id: &str,
        kind: BlobKind,
        content: Vec<u8>,
    ) -> TransportFuture<'_, UploadBlobResponse> {
        let mut state = self.lock();
        state.calls.push(Call::Upload { session_id: session_id.to_string(), kind, content: content.clone() });
        let delay = state.upload_delay;
        let result = if state.fail_uploads || state.failing_sessions.contains(session_id) {
            Err(TransportError::Server { status: 503, message: "unavailable".into() })
        } else if state.sessions.contains_key(session_id) {
            let now = tick(&mut state);
            state.blobs.insert(blob_url(session_id, kind), content);
            if let Some(session) = state.sessions.get_mut(session_id) {
                session.updated_at = now;
            }
            Ok(UploadBlobResponse { updated_at: now })
        } else {
            Err(TransportError::NotFound(format!("session {session_id}")))
        };
        drop(state);

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }

    fn fetch_blob(&self, url: &str) -> TransportFuture<'_, Vec<u8>> {
        let mut state = self.lock();
        state.calls.push(Call::FetchBlob(url.to_string()));
        let failing = state
            .failing_sessions
            .iter()
            .any(|session_id| url.starts_with(&format!("mock://blobs/{session_id}/")));
        if failing {
            return ready(Err(TransportError::Server { status: 503, message: "unavailable".into() }));
        }
        let result = state.blobs.get(url).cloned().ok_or_else(|| TransportError::NotFound(url.to_string()));
        ready(result)
    }

    fn token_valid(&self) -> TransportFuture<'_, bool> {
        let mut state = self.lock();
        state.calls.push(Call::TokenValid);
        ready(Ok(state.token_valid))
    }
}

// ── Recording messenger ──────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingMessenger {
    messages: StdMutex<Vec<HostMessage>>,
    completion: StdMutex<Option<Result<String, CompletionError>>>,
    completion_delay: StdMutex<Option<Duration>>,
    completion_requests: StdMutex<usize>,
}

impl RecordingMessenger {
    pub fn messages(&self) -> Vec<HostMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn set_completion(&self, completion: Result<String, CompletionError>) {
        *self.completion.lock().unwrap() = Some(completion);
    }

    pub fn set_completion_delay(&self, delay: Duration) {
        *self.completion_delay.lock().unwrap() = Some(delay);
    }

    pub fn completion_requests(&self) -> usize {
        *self.completion_requests.lock().unwrap()
    }
}

impl ExtensionMessenger for RecordingMessenger {
    fn send_message(&self, message: HostMessage) {
        self.messages.lock().unwrap().push(message);
    }

    fn request_completion(&self, _system: &str, _prompt: &str) -> CompletionFuture {
        *self.completion_requests.lock().unwrap() += 1;
        let completion =
            self.completion.lock().unwrap().clone().unwrap_or(Err(CompletionError::Unavailable));
        let delay = *self.completion_delay.lock().unwrap();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            completion
        })
    }
}

// ── Harness ──────────────────────────────────────────────────────────

pub struct Harness {
    pub tmp: TempDir,
    pub transport: Arc<MockTransport>,
    pub persistence: Arc<MemoryPersistence>,
    pub task_data: Arc<FsTaskDataProvider>,
    pub credentials: Arc<StaticCredentialSource>,
    pub messenger: Arc<RecordingMessenger>,
    pub engine: Arc<Engine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|builder| builder)
    }

    pub fn with(configure: impl FnOnce(EngineBuilder) -> EngineBuilder) -> Self {
        let tmp = TempDir::new().expect("tempdir should be created");
        let transport = Arc::new(MockTransport::new());
        let persistence = Arc::new(MemoryPersistence::new());
        let task_data = Arc::new(FsTaskDataProvider::new(tmp.path()));
        let credentials = Arc::new(StaticCredentialSource::new(Some("token-1".into())));
        let messenger = Arc::new(RecordingMessenger::default());

        let builder = Engine::builder(
            transport.clone(),
            persistence.clone(),
            task_data.clone(),
            credentials.clone(),
        )
        .messenger(messenger.clone());
        let engine = Arc::new(configure(builder).build());

        Self { tmp, transport, persistence, task_data, credentials, messenger, engine }
    }

    /// Write a task file and return its path.
    pub fn write_task_file(&self, task_id: &str, kind: BlobKind, content: &str) -> PathBuf {
        let files = self.task_data.ensure_task_dir(task_id).expect("task dir should be created");
        let path = files.path_for(kind).expect("kind should have a local file").to_path_buf();
        std::fs::write(&path, content).expect("task file should be written");
        path
    }

    /// Write a task file and queue the change.
    pub fn change(&self, task_id: &str, kind: BlobKind, content: &str) {
        let path = self.write_task_file(task_id, kind, content);
        self.engine
            .record_file_change(FileChange::new(task_id, kind, path))
            .expect("change should be queued");
    }
}

pub fn conversation(text: &str) -> String {
    serde_json::json!([{ "role": "user", "content": text }]).to_string()
}

pub fn transcript(text: &str) -> String {
    serde_json::json!([{ "type": "say", "say": "task", "text": text, "ts": 1 }]).to_string()
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
