// Working-tree capture and restore for session sync.
//
// Capture records remote, HEAD, branch and a binary patch of every local
// change (untracked files are marked intent-to-add first). Restore replays a
// snapshot on top of a possibly dirty checkout. Both are best effort: each
// failing git step is logged and the remaining steps still run.

use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tether_common::types::GitStateSnapshot;
use tracing::{debug, warn};

use super::worker::{CommandExecutor, GitWorker, ProcessCommandExecutor, EMPTY_TREE_OID};

/// Patches larger than this are dropped from the snapshot.
pub const MAX_PATCH_BYTES: usize = 1024 * 1024;

const RESTORE_STASH_MESSAGE: &str = "tether: local changes before session restore";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutTarget {
    Branch(String),
    Detached(String),
}

/// What `restore` actually did; failed steps are counted in `failed_steps`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub stashed: bool,
    pub checkout: Option<CheckoutTarget>,
    pub patch_applied: bool,
    pub stash_popped: bool,
    pub failed_steps: usize,
}

pub struct GitStateService {
    worker: Option<GitWorker<Arc<dyn CommandExecutor>>>,
    max_patch_bytes: usize,
}

impl GitStateService {
    /// Service rooted at `repo_path`; `None` disables capture and restore.
    pub fn new(repo_path: Option<PathBuf>) -> Self {
        Self::with_executor(repo_path, Arc::new(ProcessCommandExecutor))
    }

    pub fn with_executor(repo_path: Option<PathBuf>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            worker: repo_path.map(|path| GitWorker::with_executor(path, executor)),
            max_patch_bytes: MAX_PATCH_BYTES,
        }
    }

    pub fn disabled() -> Self {
        Self { worker: None, max_patch_bytes: MAX_PATCH_BYTES }
    }

    pub fn with_max_patch_bytes(mut self, max_patch_bytes: usize) -> Self {
        self.max_patch_bytes = max_patch_bytes;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.worker.is_some()
    }

    /// Origin URL of the workspace repository, without capturing a patch.
    pub fn remote_url(&self) -> Option<String> {
        let worker = self.worker.as_ref()?;
        worker.remote_url().unwrap_or_else(|error| {
            debug!(error = %error, "no git remote url");
            None
        })
    }

    /// Snapshot the working tree. `None` when disabled or not inside a repository.
    pub fn capture_state(&self) -> Option<GitStateSnapshot> {
        let worker = self.worker.as_ref()?;
        if !worker.is_work_tree() {
            debug!(path = %worker.repo_path().display(), "workspace is not a git work tree");
            return None;
        }

        let remote_url = worker.remote_url().unwrap_or_else(|error| {
            warn!(error = %error, "failed to read git remote url");
            None
        });

        let has_commits = worker.has_commits();
        let head = if has_commits {
            match worker.rev_parse_head() {
                Ok(head) => Some(head),
                Err(error) => {
                    warn!(error = %error, "failed to resolve git HEAD");
                    None
                }
            }
        } else {
            None
        };
        let branch = worker.current_branch();

        match worker.untracked_files() {
            Ok(untracked) => {
                if let Err(error) = worker.add_intent_to_add(&untracked) {
                    warn!(error = %error, files = untracked.len(), "failed to mark untracked files");
                }
            }
            Err(error) => warn!(error = %error, "failed to list untracked files"),
        }

        let base = if has_commits { "HEAD" } else { EMPTY_TREE_OID };
        let patch = match worker.diff_against(base) {
            Ok(patch) if patch.len() > self.max_patch_bytes => {
                warn!(
                    bytes = patch.len(),
                    limit = self.max_patch_bytes,
                    "working tree patch too large; uploading git state without it"
                );
                String::new()
            }
            Ok(patch) => patch,
            Err(error) => {
                warn!(error = %error, "failed to diff working tree");
                String::new()
            }
        };

        Some(GitStateSnapshot { remote_url, head, branch, patch })
    }

    /// Replay `snapshot` onto the working tree, preserving local changes in a stash.
    pub fn restore(&self, snapshot: &GitStateSnapshot) -> RestoreReport {
        let mut report = RestoreReport::default();
        let Some(worker) = self.worker.as_ref() else {
            warn!("git state restore requested without a workspace repository");
            return report;
        };

        match worker.is_dirty() {
            Ok(true) => report.stashed = stash_local_changes(worker, &mut report.failed_steps),
            Ok(false) => {}
            Err(error) => {
                report.failed_steps += 1;
                warn!(error = %error, "failed to inspect working tree before restore");
            }
        }

        if let Some(head) = snapshot.head.as_deref() {
            let target = match snapshot.branch.as_deref() {
                Some(branch) if worker.resolve_branch(branch).as_deref() == Some(head) => {
                    CheckoutTarget::Branch(branch.to_string())
                }
                _ => CheckoutTarget::Detached(head.to_string()),
            };
            let result = match &target {
                CheckoutTarget::Branch(branch) => worker.checkout_branch(branch),
                CheckoutTarget::Detached(commit) => worker.checkout_detached(commit),
            };
            match result {
                Ok(()) => report.checkout = Some(target),
                Err(error) => {
                    report.failed_steps += 1;
                    warn!(error = %error, head, "failed to check out session commit");
                }
            }
        }

        if !snapshot.patch.is_empty() {
            match worker.apply(&snapshot.patch) {
                Ok(()) => report.patch_applied = true,
                Err(error) => {
                    report.failed_steps += 1;
                    warn!(error = %error, "failed to apply session patch");
                }
            }
        }

        if report.stashed {
            match worker.stash_pop() {
                Ok(()) => report.stash_popped = true,
                Err(error) => {
                    report.failed_steps += 1;
                    warn!(error = %error, "failed to pop stashed local changes; they remain in the stash");
                }
            }
        }

        report
    }
}

fn stash_local_changes<E: CommandExecutor>(worker: &GitWorker<E>, failed_steps: &mut usize) -> bool {
    let before = worker.stash_count();
    if let Err(error) = worker.stash_push(RESTORE_STASH_MESSAGE) {
        *failed_steps += 1;
        warn!(error = %error, "failed to stash local changes before restore");
        return false;
    }
    // `stash push` exits 0 without creating an entry when nothing is stashable.
    match (before, worker.stash_count()) {
        (Ok(before), Ok(after)) => after > before,
        (Err(error), _) | (_, Err(error)) => {
            *failed_steps += 1;
            warn!(error = %error, "failed to count stash entries");
            false
        }
    }
}

/// Hex SHA-256 of the snapshot's JSON encoding; used to skip unchanged uploads.
pub fn state_hash(snapshot: &GitStateSnapshot) -> String {
    let encoded = serde_json::to_vec(snapshot).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}
