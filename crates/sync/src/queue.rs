// Sync queue: append-only record of local file changes awaiting upload.
//
// Items for the same (task, blob kind) pair coalesce at upload time: only the
// newest item's content is read, and every item stamped at or before the
// upload start is evicted together. Items stamped after the upload started
// survive for the next pass.

use std::collections::HashSet;
use std::path::PathBuf;

use tether_common::types::BlobKind;
use tracing::warn;

// ── Types ───────────────────────────────────────────────────────────

/// Monotonic enqueue stamp. Strictly increasing per queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Stamp(u64);

impl Stamp {
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// A local file-change notification before the queue stamps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub task_id: String,
    pub blob_kind: BlobKind,
    pub content_ref: PathBuf,
}

impl FileChange {
    pub fn new(task_id: impl Into<String>, blob_kind: BlobKind, content_ref: impl Into<PathBuf>) -> Self {
        Self { task_id: task_id.into(), blob_kind, content_ref: content_ref.into() }
    }
}

/// A queued change. Never mutated after enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncQueueItem {
    pub task_id: String,
    pub blob_kind: BlobKind,
    pub content_ref: PathBuf,
    pub enqueued_at: Stamp,
}

// ── Queue ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SyncQueue {
    items: Vec<SyncQueueItem>,
    last_stamp: u64,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a change and return its stamp.
    ///
    /// Git state is captured by the sync pass itself, so `BlobKind::GitState`
    /// changes are rejected.
    pub fn enqueue(&mut self, change: FileChange) -> Option<Stamp> {
        if !change.blob_kind.is_queueable() {
            warn!(task_id = %change.task_id, kind = %change.blob_kind, "ignoring non-queueable blob change");
            return None;
        }

        self.last_stamp += 1;
        let stamp = Stamp(self.last_stamp);
        self.items.push(SyncQueueItem {
            task_id: change.task_id,
            blob_kind: change.blob_kind,
            content_ref: change.content_ref,
            enqueued_at: stamp,
        });
        Some(stamp)
    }

    /// The most recently issued stamp. Used as the upload-start marker.
    pub fn now(&self) -> Stamp {
        Stamp(self.last_stamp)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Distinct task ids in first-enqueue order.
    pub fn unique_task_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.items
            .iter()
            .filter(|item| seen.insert(item.task_id.as_str()))
            .map(|item| item.task_id.clone())
            .collect()
    }

    pub fn items_for_task(&self, task_id: &str) -> Vec<&SyncQueueItem> {
        self.items.iter().filter(|item| item.task_id == task_id).collect()
    }

    /// Distinct blob kinds queued for a task, in first-enqueue order.
    pub fn blob_kinds_for_task(&self, task_id: &str) -> Vec<BlobKind> {
        let mut kinds = Vec::new();
        for item in self.items.iter().filter(|item| item.task_id == task_id) {
            if !kinds.contains(&item.blob_kind) {
                kinds.push(item.blob_kind);
            }
        }
        kinds
    }

    /// Most recently enqueued item for the pair.
    pub fn last_item_for_blob(&self, task_id: &str, blob_kind: BlobKind) -> Option<&SyncQueueItem> {
        self.items
            .iter()
            .filter(|item| item.task_id == task_id && item.blob_kind == blob_kind)
            .max_by_key(|item| item.enqueued_at)
    }

    /// Remove items of the pair stamped at or before `upload_stamp`.
    /// Returns the number of evicted items.
    pub fn remove_processed_items(
        &mut self,
        task_id: &str,
        blob_kind: BlobKind,
        upload_stamp: Stamp,
    ) -> usize {
        let before = self.items.len();
        self.items.retain(|item| {
            !(item.task_id == task_id
                && item.blob_kind == blob_kind
                && item.enqueued_at <= upload_stamp)
        });
        before - self.items.len()
    }

    /// Drop everything. Returns the number of discarded items.
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }
}
