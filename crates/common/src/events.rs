// Events the sync engine emits to the host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A remote session was created for a previously unmapped task.
    SessionCreated { session_id: String, timestamp: DateTime<Utc> },
    /// A sync pass advanced the session's high-water mark.
    SessionSynced { session_id: String, updated_at: DateTime<Utc>, timestamp: DateTime<Utc> },
    /// A remote session was pulled back into a local task.
    SessionRestored,
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::SessionSynced { .. } => "session_synced",
            Self::SessionRestored => "session_restored",
        }
    }
}
