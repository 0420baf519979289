// Task data on disk: where a task's conversation, transcript and metadata
// live, how restored tasks are registered, and the mode/model a task runs with.
//
// Layout under the data root:
//   tasks/<task_id>/api_conversation_history.json   conversation blob
//   tasks/<task_id>/ui_messages.json                transcript blob
//   tasks/<task_id>/task_metadata.json              metadata blob
//   state/task_history.json                         task registry

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_common::types::BlobKind;
use tracing::warn;

pub const CONVERSATION_FILE: &str = "api_conversation_history.json";
pub const TRANSCRIPT_FILE: &str = "ui_messages.json";
pub const METADATA_FILE: &str = "task_metadata.json";

const TASKS_DIR: &str = "tasks";
const REGISTRY_PATH: &str = "state/task_history.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFiles {
    pub dir: PathBuf,
    pub conversation: PathBuf,
    pub transcript: PathBuf,
    pub metadata: PathBuf,
}

impl TaskFiles {
    fn in_dir(dir: PathBuf) -> Self {
        Self {
            conversation: dir.join(CONVERSATION_FILE),
            transcript: dir.join(TRANSCRIPT_FILE),
            metadata: dir.join(METADATA_FILE),
            dir,
        }
    }

    /// Local file backing a blob kind; git state has none.
    pub fn path_for(&self, kind: BlobKind) -> Option<&Path> {
        match kind {
            BlobKind::Conversation => Some(&self.conversation),
            BlobKind::Transcript => Some(&self.transcript),
            BlobKind::Metadata => Some(&self.metadata),
            BlobKind::GitState => None,
        }
    }
}

/// Mode and model a task last ran with, as recorded in its metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Registry entry that makes a task visible in the host's task history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub registered_at: DateTime<Utc>,
}

pub trait TaskDataProvider: Send + Sync {
    fn task_files(&self, task_id: &str) -> TaskFiles;

    /// Create the task directory if needed.
    fn ensure_task_dir(&self, task_id: &str) -> Result<TaskFiles>;

    /// Delete the task directory and everything in it. Missing is fine.
    fn remove_task_dir(&self, task_id: &str) -> Result<()>;

    fn task_context(&self, task_id: &str) -> TaskContext;

    /// Insert or replace the registry entry for `record.task_id`.
    fn register_task(&self, record: TaskRecord) -> Result<()>;

    /// Map a changed file back to its task and blob kind.
    fn task_id_for_path(&self, path: &Path) -> Option<(String, BlobKind)>;
}

#[derive(Debug, Clone)]
pub struct FsTaskDataProvider {
    root: PathBuf,
}

impl FsTaskDataProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join(TASKS_DIR)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_PATH)
    }

    pub fn registered_tasks(&self) -> Result<Vec<TaskRecord>> {
        let path = self.registry_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read task registry `{}`", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse task registry `{}`", path.display()))
    }
}

impl TaskDataProvider for FsTaskDataProvider {
    fn task_files(&self, task_id: &str) -> TaskFiles {
        TaskFiles::in_dir(self.tasks_dir().join(task_id))
    }

    fn ensure_task_dir(&self, task_id: &str) -> Result<TaskFiles> {
        let files = self.task_files(task_id);
        fs::create_dir_all(&files.dir)
            .with_context(|| format!("failed to create task directory `{}`", files.dir.display()))?;
        Ok(files)
    }

    fn remove_task_dir(&self, task_id: &str) -> Result<()> {
        let dir = self.task_files(task_id).dir;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error)
                .with_context(|| format!("failed to remove task directory `{}`", dir.display())),
        }
    }

    fn task_context(&self, task_id: &str) -> TaskContext {
        let path = self.task_files(task_id).metadata;
        let Ok(raw) = fs::read_to_string(&path) else {
            return TaskContext::default();
        };
        serde_json::from_str(&raw).unwrap_or_else(|error| {
            warn!(task_id, error = %error, "task metadata is not valid JSON");
            TaskContext::default()
        })
    }

    fn register_task(&self, record: TaskRecord) -> Result<()> {
        let mut records = self.registered_tasks()?;
        records.retain(|existing| existing.task_id != record.task_id);
        records.push(record);

        let path = self.registry_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create `{}`", parent.display()))?;
        }
        let encoded =
            serde_json::to_vec_pretty(&records).context("failed to encode task registry")?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, encoded)
            .with_context(|| format!("failed to write `{}`", staging.display()))?;
        fs::rename(&staging, &path)
            .with_context(|| format!("failed to replace task registry `{}`", path.display()))?;
        Ok(())
    }

    fn task_id_for_path(&self, path: &Path) -> Option<(String, BlobKind)> {
        let relative = path.strip_prefix(self.tasks_dir()).ok()?;
        let mut components = relative.components();
        let (Some(Component::Normal(task_id)), Some(Component::Normal(file)), None) =
            (components.next(), components.next(), components.next())
        else {
            return None;
        };
        let kind = match file.to_str()? {
            CONVERSATION_FILE => BlobKind::Conversation,
            TRANSCRIPT_FILE => BlobKind::Transcript,
            METADATA_FILE => BlobKind::Metadata,
            _ => return None,
        };
        Some((task_id.to_str()?.to_string(), kind))
    }
}
