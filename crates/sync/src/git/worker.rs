use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Object id of the empty tree; diff base for repositories without commits.
pub const EMPTY_TREE_OID: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitWorkerError {
    SpawnFailed { command: String, message: String },
    CommandFailed { command: String, code: Option<i32>, stderr: String },
}

impl Display for GitWorkerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            GitWorkerError::SpawnFailed { command, message } => {
                write!(f, "failed to run `{command}`: {message}")
            }
            GitWorkerError::CommandFailed { command, code, stderr } => {
                write!(f, "`{command}` failed with code {:?}: {}", code, stderr.trim())
            }
        }
    }
}

impl Error for GitWorkerError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

pub trait CommandExecutor: Send + Sync {
    /// Run `program` in `cwd`, piping `stdin` to the child when given.
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        stdin: Option<&[u8]>,
    ) -> Result<CommandResult, std::io::Error>;
}

impl<E: CommandExecutor + ?Sized> CommandExecutor for Arc<E> {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        stdin: Option<&[u8]>,
    ) -> Result<CommandResult, std::io::Error> {
        (**self).execute(program, args, cwd, stdin)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessCommandExecutor;

impl CommandExecutor for ProcessCommandExecutor {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        stdin: Option<&[u8]>,
    ) -> Result<CommandResult, std::io::Error> {
        let mut command = Command::new(program);
        command.args(args).current_dir(cwd).stdout(Stdio::piped()).stderr(Stdio::piped());
        command.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut child = command.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)?;
        }
        let output = child.wait_with_output()?;
        Ok(CommandResult {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Thin typed wrapper over the git commands session capture and restore need.
#[derive(Debug, Clone)]
pub struct GitWorker<E = ProcessCommandExecutor> {
    repo_path: PathBuf,
    executor: E,
}

impl GitWorker<ProcessCommandExecutor> {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self { repo_path: repo_path.into(), executor: ProcessCommandExecutor }
    }
}

impl<E: CommandExecutor> GitWorker<E> {
    pub fn with_executor(repo_path: impl Into<PathBuf>, executor: E) -> Self {
        Self { repo_path: repo_path.into(), executor }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn is_work_tree(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|output| output.stdout.trim() == "true")
            .unwrap_or(false)
    }

    pub fn remote_url(&self) -> Result<Option<String>, GitWorkerError> {
        match self.run(&["config", "--get", "remote.origin.url"]) {
            Ok(output) => Ok(non_empty(output.stdout)),
            // `git config --get` exits 1 when the key is unset.
            Err(GitWorkerError::CommandFailed { code: Some(1), .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    pub fn has_commits(&self) -> bool {
        self.run(&["rev-parse", "--verify", "--quiet", "HEAD"]).is_ok()
    }

    pub fn rev_parse_head(&self) -> Result<String, GitWorkerError> {
        self.run(&["rev-parse", "HEAD"]).map(|output| output.stdout.trim().to_string())
    }

    /// Resolve a local branch to its commit; `None` when it does not exist.
    pub fn resolve_branch(&self, branch: &str) -> Option<String> {
        let reference = format!("refs/heads/{branch}");
        self.run(&["rev-parse", "--verify", "--quiet", &reference])
            .ok()
            .and_then(|output| non_empty(output.stdout))
    }

    /// Current branch name; `None` on a detached HEAD. Works on an unborn branch.
    pub fn current_branch(&self) -> Option<String> {
        self.run(&["symbolic-ref", "--short", "--quiet", "HEAD"])
            .ok()
            .and_then(|output| non_empty(output.stdout))
    }

    pub fn untracked_files(&self) -> Result<Vec<String>, GitWorkerError> {
        let output = self.run(&["ls-files", "--others", "--exclude-standard", "-z"])?;
        Ok(output.stdout.split('\0').filter(|path| !path.is_empty()).map(str::to_string).collect())
    }

    /// Mark paths intent-to-add so a working-tree diff includes them.
    pub fn add_intent_to_add(&self, paths: &[String]) -> Result<(), GitWorkerError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add".to_string(), "--intent-to-add".to_string(), "--".to_string()];
        args.extend(paths.iter().cloned());
        self.run_owned(args, None).map(|_| ())
    }

    /// Binary-safe patch of the working tree (staged and unstaged) against `base`.
    pub fn diff_against(&self, base: &str) -> Result<String, GitWorkerError> {
        self.run(&["diff", "--binary", "--no-color", "--no-ext-diff", base])
            .map(|output| output.stdout)
    }

    pub fn is_dirty(&self) -> Result<bool, GitWorkerError> {
        self.run(&["status", "--porcelain"]).map(|output| !output.stdout.trim().is_empty())
    }

    pub fn stash_count(&self) -> Result<usize, GitWorkerError> {
        self.run(&["stash", "list"]).map(|output| output.stdout.lines().count())
    }

    pub fn stash_push(&self, message: &str) -> Result<(), GitWorkerError> {
        self.run(&["stash", "push", "--include-untracked", "-m", message]).map(|_| ())
    }

    pub fn stash_pop(&self) -> Result<(), GitWorkerError> {
        self.run(&["stash", "pop"]).map(|_| ())
    }

    pub fn checkout_branch(&self, branch: &str) -> Result<(), GitWorkerError> {
        self.run(&["checkout", branch]).map(|_| ())
    }

    pub fn checkout_detached(&self, commit: &str) -> Result<(), GitWorkerError> {
        self.run(&["checkout", "--detach", commit]).map(|_| ())
    }

    /// Apply a patch read from stdin.
    pub fn apply(&self, patch: &str) -> Result<(), GitWorkerError> {
        let args = vec!["apply".to_string(), "--whitespace=nowarn".to_string()];
        self.run_owned(args, Some(patch.as_bytes())).map(|_| ())
    }

    fn run(&self, args: &[&str]) -> Result<GitCommandOutput, GitWorkerError> {
        self.run_owned(args.iter().map(|arg| arg.to_string()).collect(), None)
    }

    fn run_owned(
        &self,
        args: Vec<String>,
        stdin: Option<&[u8]>,
    ) -> Result<GitCommandOutput, GitWorkerError> {
        let command = format!("git {}", args.join(" "));
        let result =
            self.executor.execute("git", &args, &self.repo_path, stdin).map_err(|error| {
                GitWorkerError::SpawnFailed { command: command.clone(), message: error.to_string() }
            })?;

        if result.success {
            return Ok(GitCommandOutput { stdout: result.stdout, stderr: result.stderr });
        }

        let stderr = if result.stderr.trim().is_empty() { result.stdout } else { result.stderr };

        Err(GitWorkerError::CommandFailed { command, code: result.code, stderr })
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
