// Local persistence for the sync engine: the task → session mapping and the
// "last active session" pointer.

pub mod sqlite;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;

pub use sqlite::SqlitePersistence;

/// Durable engine state. Writing a mapping for a session that another task
/// already maps removes the older task's mapping, so a session is owned by at
/// most one task.
pub trait LocalPersistence: Send + Sync {
    fn last_session_id(&self) -> Result<Option<String>>;

    fn set_last_session_id(&self, session_id: &str) -> Result<()>;

    fn session_for_task(&self, task_id: &str) -> Result<Option<String>>;

    fn task_for_session(&self, session_id: &str) -> Result<Option<String>>;

    fn set_task_session(&self, task_id: &str, session_id: &str) -> Result<()>;
}

/// Process-local persistence for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    last_session_id: Option<String>,
    task_sessions: HashMap<String, String>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn mapping_count(&self) -> usize {
        self.lock().task_sessions.len()
    }
}

impl LocalPersistence for MemoryPersistence {
    fn last_session_id(&self) -> Result<Option<String>> {
        Ok(self.lock().last_session_id.clone())
    }

    fn set_last_session_id(&self, session_id: &str) -> Result<()> {
        self.lock().last_session_id = Some(session_id.to_string());
        Ok(())
    }

    fn session_for_task(&self, task_id: &str) -> Result<Option<String>> {
        Ok(self.lock().task_sessions.get(task_id).cloned())
    }

    fn task_for_session(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .task_sessions
            .iter()
            .find(|(_, mapped)| mapped.as_str() == session_id)
            .map(|(task_id, _)| task_id.clone()))
    }

    fn set_task_session(&self, task_id: &str, session_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.task_sessions.retain(|existing, mapped| existing == task_id || mapped != session_id);
        state.task_sessions.insert(task_id.to_string(), session_id.to_string());
        Ok(())
    }
}
