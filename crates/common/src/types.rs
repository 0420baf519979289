// Core domain types shared across all Tether crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One named chunk of session content, uploaded and downloaded as an opaque unit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BlobKind {
    /// Model-facing conversation history.
    Conversation,
    /// UI-facing transcript of the task.
    Transcript,
    /// Task metadata (mode, model, files in context).
    Metadata,
    /// Working-tree snapshot captured by the git state service.
    GitState,
}

impl BlobKind {
    /// Kinds that originate from local file-change notifications.
    pub const QUEUEABLE: [BlobKind; 3] =
        [BlobKind::Conversation, BlobKind::Transcript, BlobKind::Metadata];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Transcript => "transcript",
            Self::Metadata => "metadata",
            Self::GitState => "git_state",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "conversation" => Some(Self::Conversation),
            "transcript" => Some(Self::Transcript),
            "metadata" => Some(Self::Metadata),
            "git_state" => Some(Self::GitState),
            _ => None,
        }
    }

    pub const fn is_queueable(self) -> bool {
        !matches!(self, Self::GitState)
    }
}

impl std::fmt::Display for BlobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signed download URLs for each blob a remote session holds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobUrls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_state: Option<String>,
}

impl BlobUrls {
    pub fn get(&self, kind: BlobKind) -> Option<&str> {
        match kind {
            BlobKind::Conversation => self.conversation.as_deref(),
            BlobKind::Transcript => self.transcript.as_deref(),
            BlobKind::Metadata => self.metadata.as_deref(),
            BlobKind::GitState => self.git_state.as_deref(),
        }
    }
}

/// Authoritative session record owned by the cloud session store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteSession {
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub git_url: Option<String>,
    pub created_on_platform: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub last_mode: Option<String>,
    #[serde(default)]
    pub last_model: Option<String>,
    pub version: String,
    #[serde(default)]
    pub blob_urls: BlobUrls,
}

impl RemoteSession {
    /// The remote title, ignoring blank values.
    pub fn existing_title(&self) -> Option<&str> {
        self.title.as_deref().map(str::trim).filter(|title| !title.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

/// Working-tree identity captured for a session, uploaded as the `git_state` blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitStateSnapshot {
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub head: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub patch: String,
}
