// Integration tests: working-tree capture and restore against real git.

mod support;

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;
use tether_common::types::{BlobKind, GitStateSnapshot};
use tether_sync::git::{CheckoutTarget, GitStateService};

use support::{transcript, Harness};

fn run_git(cwd: &Path, args: &[&str]) -> String {
    let output = Command::new("git").args(args).current_dir(cwd).output().expect("git should run");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

struct Repos {
    _temp: TempDir,
    remote: PathBuf,
    work: PathBuf,
    root: PathBuf,
}

/// A work repo with one pushed commit on `main`.
fn repos() -> Repos {
    let temp = TempDir::new().expect("tempdir should be created");
    let root = temp.path().to_path_buf();
    let remote = root.join("remote.git");
    let work = root.join("work");

    run_git(&root, &["init", "--bare", remote.to_str().expect("utf8 remote path")]);
    run_git(&root, &["init", "-b", "main", work.to_str().expect("utf8 work path")]);
    run_git(&work, &["config", "user.name", "Tether Bot"]);
    run_git(&work, &["config", "user.email", "tether-bot@example.test"]);
    run_git(&work, &["remote", "add", "origin", remote.to_str().expect("utf8 remote path")]);

    std::fs::write(work.join("src.txt"), "one\n").expect("seed file should be written");
    std::fs::write(work.join("notes.txt"), "notes\n").expect("seed file should be written");
    run_git(&work, &["add", "."]);
    run_git(&work, &["commit", "-m", "initial"]);
    run_git(&work, &["push", "-u", "origin", "main"]);

    Repos { _temp: temp, remote, work, root }
}

fn clone(repos: &Repos, name: &str) -> PathBuf {
    let target = repos.root.join(name);
    run_git(
        &repos.root,
        &[
            "clone",
            "-b",
            "main",
            repos.remote.to_str().expect("utf8 remote path"),
            target.to_str().expect("utf8 clone path"),
        ],
    );
    run_git(&target, &["config", "user.name", "Tether Bot"]);
    run_git(&target, &["config", "user.email", "tether-bot@example.test"]);
    target
}

fn dirty_snapshot(repos: &Repos) -> GitStateSnapshot {
    std::fs::write(repos.work.join("src.txt"), "one\ntwo\n").unwrap();
    std::fs::write(repos.work.join("fresh.txt"), "brand new\n").unwrap();
    GitStateService::new(Some(repos.work.clone()))
        .capture_state()
        .expect("work tree should be captured")
}

#[test]
fn capture_records_head_branch_remote_and_untracked_files() {
    let repos = repos();

    let snapshot = dirty_snapshot(&repos);

    assert_eq!(snapshot.head.as_deref(), Some(run_git(&repos.work, &["rev-parse", "HEAD"]).as_str()));
    assert_eq!(snapshot.branch.as_deref(), Some("main"));
    assert_eq!(snapshot.remote_url.as_deref(), repos.remote.to_str());
    assert!(snapshot.patch.contains("src.txt"));
    assert!(snapshot.patch.contains("fresh.txt"));
    assert!(snapshot.patch.contains("+brand new"));
}

#[test]
fn clean_tree_has_empty_patch() {
    let repos = repos();

    let snapshot = GitStateService::new(Some(repos.work.clone())).capture_state().unwrap();

    assert!(snapshot.patch.is_empty());
    assert!(snapshot.head.is_some());
}

#[test]
fn oversized_patch_is_dropped_but_identity_kept() {
    let repos = repos();
    std::fs::write(repos.work.join("src.txt"), "x".repeat(4096)).unwrap();

    let snapshot = GitStateService::new(Some(repos.work.clone()))
        .with_max_patch_bytes(1024)
        .capture_state()
        .unwrap();

    assert!(snapshot.patch.is_empty());
    assert_eq!(snapshot.branch.as_deref(), Some("main"));
    assert!(snapshot.head.is_some());
}

#[test]
fn directory_outside_a_repository_captures_nothing() {
    let temp = TempDir::new().unwrap();

    assert_eq!(GitStateService::new(Some(temp.path().to_path_buf())).capture_state(), None);
}

#[test]
fn restore_into_clone_reproduces_working_tree() {
    let repos = repos();
    let snapshot = dirty_snapshot(&repos);
    let target = clone(&repos, "clone");

    let report = GitStateService::new(Some(target.clone())).restore(&snapshot);

    assert_eq!(report.failed_steps, 0);
    assert_eq!(report.checkout, Some(CheckoutTarget::Branch("main".into())));
    assert!(report.patch_applied);
    assert!(!report.stashed);
    assert_eq!(std::fs::read_to_string(target.join("src.txt")).unwrap(), "one\ntwo\n");
    assert_eq!(std::fs::read_to_string(target.join("fresh.txt")).unwrap(), "brand new\n");
}

#[test]
fn restore_keeps_unrelated_local_changes() {
    let repos = repos();
    let snapshot = dirty_snapshot(&repos);
    let target = clone(&repos, "dirty-clone");
    std::fs::write(target.join("notes.txt"), "local edit\n").unwrap();

    let report = GitStateService::new(Some(target.clone())).restore(&snapshot);

    assert!(report.stashed);
    assert!(report.stash_popped);
    assert!(report.patch_applied);
    assert_eq!(report.failed_steps, 0);
    assert_eq!(std::fs::read_to_string(target.join("notes.txt")).unwrap(), "local edit\n");
    assert_eq!(std::fs::read_to_string(target.join("src.txt")).unwrap(), "one\ntwo\n");
}

#[test]
fn restore_of_unknown_commit_reports_failure_and_continues() {
    let repos = repos();
    let target = clone(&repos, "other");
    let snapshot = GitStateSnapshot {
        remote_url: None,
        head: Some("0123456789abcdef0123456789abcdef01234567".into()),
        branch: Some("main".into()),
        patch: String::new(),
    };

    let report = GitStateService::new(Some(target)).restore(&snapshot);

    assert_eq!(report.checkout, None);
    assert_eq!(report.failed_steps, 1);
}

#[tokio::test]
async fn sync_uploads_git_state_only_when_it_changes() {
    let repos = repos();
    let work = repos.work.clone();
    let harness = Harness::with(|builder| builder.git(GitStateService::new(Some(work))));

    harness.change("t-1", BlobKind::Transcript, &transcript("a"));
    harness.engine.sync(false).wait().await;
    harness.change("t-1", BlobKind::Transcript, &transcript("b"));
    harness.engine.sync(false).wait().await;

    assert_eq!(harness.transport.uploads_of(BlobKind::GitState), 1);
    assert_eq!(harness.transport.creates()[0].git_url.as_deref(), repos.remote.to_str());
    assert!(harness.transport.updates().is_empty());

    std::fs::write(repos.work.join("src.txt"), "changed\n").unwrap();
    harness.change("t-1", BlobKind::Transcript, &transcript("c"));
    harness.engine.sync(false).wait().await;

    assert_eq!(harness.transport.uploads_of(BlobKind::GitState), 2);
    let uploaded = harness.transport.blob("session-1", BlobKind::GitState).unwrap();
    let snapshot: GitStateSnapshot = serde_json::from_slice(&uploaded).unwrap();
    assert!(snapshot.patch.contains("+changed"));
}

#[tokio::test]
async fn restore_session_replays_git_state_blob() {
    let repos = repos();
    let snapshot = dirty_snapshot(&repos);
    let target = clone(&repos, "restore-target");
    let harness = Harness::with(|builder| builder.git(GitStateService::new(Some(target.clone()))));
    let encoded = serde_json::to_vec(&snapshot).unwrap();
    harness.transport.seed_session("s-1", None, &[(BlobKind::GitState, &encoded)]);

    harness.engine.restore_session("s-1", true).await.unwrap().expect("restored");

    assert_eq!(std::fs::read_to_string(target.join("fresh.txt")).unwrap(), "brand new\n");
}
