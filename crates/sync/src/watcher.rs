// Task directory watcher: inotify/fsevents → (task, blob kind) changes.
//
// Only writes to the three known task files produce changes; removals,
// metadata-only updates and paths outside the data root are dropped.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::queue::FileChange;
use crate::task_data::{FsTaskDataProvider, TaskDataProvider};

const EVENT_CHANNEL_CAPACITY: usize = 512;

pub struct TaskWatcher {
    _watcher: RecommendedWatcher,
    tasks_dir: PathBuf,
}

impl TaskWatcher {
    /// Watch `<data_root>/tasks` recursively, creating it if needed.
    pub fn start(data_root: &Path) -> Result<(Self, mpsc::Receiver<FileChange>)> {
        let tasks_dir = data_root.join("tasks");
        std::fs::create_dir_all(&tasks_dir)
            .with_context(|| format!("failed to create tasks directory: {}", tasks_dir.display()))?;
        let root = data_root
            .canonicalize()
            .with_context(|| format!("failed to canonicalize data root: {}", data_root.display()))?;
        let provider = FsTaskDataProvider::new(root);
        let tasks_dir = provider.tasks_dir();

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in translate_event(&event, &provider) {
                    if tx.blocking_send(change).is_err() {
                        debug!("change channel closed, stopping event dispatch");
                        return;
                    }
                }
            }
            Err(e) => error!(error = %e, "task watcher error"),
        })
        .context("failed to create task watcher")?;

        watcher
            .watch(&tasks_dir, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch directory: {}", tasks_dir.display()))?;

        debug!(path = %tasks_dir.display(), "task watcher started");
        Ok((Self { _watcher: watcher, tasks_dir }, rx))
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }
}

fn translate_event(event: &Event, provider: &FsTaskDataProvider) -> Vec<FileChange> {
    match &event.kind {
        EventKind::Create(_) => {}
        EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => {
            trace!("skipping metadata-only modify event");
            return Vec::new();
        }
        EventKind::Modify(_) => {}
        _ => {
            trace!(kind = ?event.kind, "skipping non-content event");
            return Vec::new();
        }
    }

    event
        .paths
        .iter()
        .filter(|path| {
            if path.starts_with(provider.root()) {
                true
            } else {
                warn!(path = %path.display(), "ignoring event outside data root");
                false
            }
        })
        .filter_map(|path| {
            provider
                .task_id_for_path(path)
                .map(|(task_id, kind)| FileChange::new(task_id, kind, path.clone()))
        })
        .collect()
}
