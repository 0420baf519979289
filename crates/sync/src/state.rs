// In-memory session facts: remote session fields last seen, title progress,
// the updated-at high-water mark, and the last uploaded git state hash per
// task. Never persisted; rebuilt from the remote session after a restart.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tether_common::types::RemoteSession;

/// Title progress for a session. `Pending` suppresses duplicate generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TitleState {
    #[default]
    Unknown,
    Pending,
    Known(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub git_url: Option<String>,
    pub mode: Option<String>,
    pub model: Option<String>,
    pub title: TitleState,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StoreInner {
    sessions: HashMap<String, SessionState>,
    task_git_hashes: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct SessionStateStore {
    inner: Mutex<StoreInner>,
}

impl SessionStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().sessions.contains_key(session_id)
    }

    pub fn snapshot(&self, session_id: &str) -> Option<SessionState> {
        self.lock().sessions.get(session_id).cloned()
    }

    /// Seed or refresh local facts from an authoritative session record.
    /// A pending title is left alone.
    pub fn observe_remote(&self, session: &RemoteSession) {
        let mut inner = self.lock();
        let state = inner.sessions.entry(session.session_id.clone()).or_default();
        state.git_url = session.git_url.clone();
        state.mode = session.last_mode.clone();
        state.model = session.last_model.clone();
        if let Some(title) = session.existing_title() {
            if state.title != TitleState::Pending {
                state.title = TitleState::Known(title.to_string());
            }
        }
        advance(state, session.updated_at);
    }

    /// Record fields the engine just sent to the store. `None` leaves a field as is.
    pub fn record_fields(
        &self,
        session_id: &str,
        git_url: Option<&str>,
        mode: Option<&str>,
        model: Option<&str>,
    ) {
        let mut inner = self.lock();
        let state = inner.sessions.entry(session_id.to_string()).or_default();
        if let Some(git_url) = git_url {
            state.git_url = Some(git_url.to_string());
        }
        if let Some(mode) = mode {
            state.mode = Some(mode.to_string());
        }
        if let Some(model) = model {
            state.model = Some(model.to_string());
        }
    }

    /// Raise the high-water mark to `updated_at` if it is newer.
    /// Returns true when the mark moved.
    pub fn advance_high_water_mark(&self, session_id: &str, updated_at: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        let state = inner.sessions.entry(session_id.to_string()).or_default();
        advance(state, updated_at)
    }

    pub fn high_water_mark(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.lock().sessions.get(session_id).and_then(|state| state.updated_at)
    }

    /// True when no title is known and none is being generated.
    pub fn needs_title(&self, session_id: &str) -> bool {
        self.lock()
            .sessions
            .get(session_id)
            .map_or(true, |state| state.title == TitleState::Unknown)
    }

    /// Move `Unknown → Pending`. Returns false if a title is pending or known.
    pub fn try_begin_title(&self, session_id: &str) -> bool {
        let mut inner = self.lock();
        let state = inner.sessions.entry(session_id.to_string()).or_default();
        if state.title != TitleState::Unknown {
            return false;
        }
        state.title = TitleState::Pending;
        true
    }

    pub fn set_title(&self, session_id: &str, title: impl Into<String>) {
        let mut inner = self.lock();
        let state = inner.sessions.entry(session_id.to_string()).or_default();
        state.title = TitleState::Known(title.into());
    }

    /// Drop a pending marker so a later pass can retry generation.
    pub fn abandon_title(&self, session_id: &str) {
        let mut inner = self.lock();
        if let Some(state) = inner.sessions.get_mut(session_id) {
            if state.title == TitleState::Pending {
                state.title = TitleState::Unknown;
            }
        }
    }

    pub fn title(&self, session_id: &str) -> TitleState {
        self.lock().sessions.get(session_id).map(|state| state.title.clone()).unwrap_or_default()
    }

    pub fn git_hash_for_task(&self, task_id: &str) -> Option<String> {
        self.lock().task_git_hashes.get(task_id).cloned()
    }

    pub fn set_git_hash_for_task(&self, task_id: &str, hash: impl Into<String>) {
        self.lock().task_git_hashes.insert(task_id.to_string(), hash.into());
    }
}

fn advance(state: &mut SessionState, updated_at: DateTime<Utc>) -> bool {
    match state.updated_at {
        Some(current) if current >= updated_at => false,
        _ => {
            state.updated_at = Some(updated_at);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn remote(id: &str, title: Option<&str>, updated: i64) -> RemoteSession {
        RemoteSession {
            session_id: id.into(),
            title: title.map(str::to_string),
            created_at: at(0),
            updated_at: at(updated),
            git_url: Some("git@example.com:a/b.git".into()),
            created_on_platform: "vscode".into(),
            organization_id: None,
            last_mode: Some("act".into()),
            last_model: None,
            version: "1.0.0".into(),
            blob_urls: Default::default(),
        }
    }

    // ── High-water mark ─────────────────────────────────────────────

    #[test]
    fn high_water_mark_ignores_older_timestamps() {
        let store = SessionStateStore::new();
        assert!(store.advance_high_water_mark("s", at(10)));
        assert!(!store.advance_high_water_mark("s", at(5)));
        assert!(!store.advance_high_water_mark("s", at(10)));
        assert!(store.advance_high_water_mark("s", at(11)));
        assert_eq!(store.high_water_mark("s"), Some(at(11)));
    }

    proptest! {
        #[test]
        fn high_water_mark_is_max_of_any_order(offsets in proptest::collection::vec(0i64..100_000, 1..40)) {
            let store = SessionStateStore::new();
            for offset in &offsets {
                store.advance_high_water_mark("s", at(*offset));
            }
            let max = offsets.iter().copied().max().unwrap();
            prop_assert_eq!(store.high_water_mark("s"), Some(at(max)));
        }
    }

    // ── Remote observation ──────────────────────────────────────────

    #[test]
    fn observe_remote_seeds_fields_and_title() {
        let store = SessionStateStore::new();
        store.observe_remote(&remote("s", Some("Refactor parser"), 3));

        let state = store.snapshot("s").unwrap();
        assert_eq!(state.git_url.as_deref(), Some("git@example.com:a/b.git"));
        assert_eq!(state.mode.as_deref(), Some("act"));
        assert_eq!(state.title, TitleState::Known("Refactor parser".into()));
        assert_eq!(state.updated_at, Some(at(3)));
        assert!(!store.needs_title("s"));
    }

    #[test]
    fn observe_remote_never_regresses_mark() {
        let store = SessionStateStore::new();
        store.advance_high_water_mark("s", at(50));
        store.observe_remote(&remote("s", None, 10));
        assert_eq!(store.high_water_mark("s"), Some(at(50)));
    }

    #[test]
    fn record_fields_only_overwrites_given_values() {
        let store = SessionStateStore::new();
        store.observe_remote(&remote("s", None, 1));
        store.record_fields("s", None, None, Some("opus"));

        let state = store.snapshot("s").unwrap();
        assert_eq!(state.mode.as_deref(), Some("act"));
        assert_eq!(state.model.as_deref(), Some("opus"));
    }

    // ── Title marker ────────────────────────────────────────────────

    #[test]
    fn pending_marker_blocks_second_generation() {
        let store = SessionStateStore::new();
        assert!(store.needs_title("s"));
        assert!(store.try_begin_title("s"));
        assert!(!store.try_begin_title("s"));
        assert!(!store.needs_title("s"));

        store.abandon_title("s");
        assert!(store.try_begin_title("s"));
        store.set_title("s", "Done");
        assert!(!store.try_begin_title("s"));
        assert_eq!(store.title("s"), TitleState::Known("Done".into()));
    }

    #[test]
    fn observe_remote_keeps_pending_marker() {
        let store = SessionStateStore::new();
        assert!(store.try_begin_title("s"));
        store.observe_remote(&remote("s", Some("Remote title"), 1));
        assert_eq!(store.title("s"), TitleState::Pending);
    }

    // ── Git hashes ──────────────────────────────────────────────────

    #[test]
    fn git_hash_is_tracked_per_task() {
        let store = SessionStateStore::new();
        assert_eq!(store.git_hash_for_task("t1"), None);
        store.set_git_hash_for_task("t1", "abc");
        assert_eq!(store.git_hash_for_task("t1").as_deref(), Some("abc"));
        assert_eq!(store.git_hash_for_task("t2"), None);
    }
}
