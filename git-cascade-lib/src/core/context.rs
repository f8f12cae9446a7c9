//! Allocating and tracking execution contexts.
//!
//! The engine never assumes it can use the user's working tree: by default
//! every rebase runs in a disposable worktree created at the trunk head,
//! so the user can keep editing while the queue drains. A context survives
//! conflict suspensions by being stored in a small file in the Git
//! directory, and continue/abort re-acquire the same tree from it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::git::{NonZeroOid, Repo};
use crate::util::now_ms;

use super::session::write_atomically;

/// The stored-context file name within the repository's Git directory.
pub const CONTEXT_FILE_NAME: &str = "cascade-context.json";

/// Timeout for the setup commands run when initializing a worktree.
const WORKTREE_SETUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How many times to attempt creating a temporary worktree before giving
/// up.
const MAX_CREATE_ATTEMPTS: usize = 3;

/// The concrete working tree the engine executes in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// The working tree's path.
    pub execution_path: PathBuf,

    /// Whether the engine owns the path exclusively; releasing a temporary
    /// context deletes it.
    pub is_temporary: bool,

    /// When the context was acquired, in milliseconds since the Unix
    /// epoch.
    pub acquired_at_ms: u64,

    /// What the context was acquired for, e.g. `rebase`.
    pub purpose: String,
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(
        "could not create an execution worktree for {repo_path:?} after {attempts} attempts: {message}"
    )]
    CreationFailed {
        repo_path: PathBuf,
        attempts: usize,
        message: String,
    },

    #[error("the working tree at {path:?} has uncommitted changes or is mid-rebase")]
    WorkingTreeBusy { path: PathBuf },

    #[error(transparent)]
    Git(#[from] crate::git::RepoError),

    #[error(transparent)]
    Other(#[from] eyre::Report),
}

fn context_path(repo: &Repo) -> PathBuf {
    repo.get_git_dir().join(CONTEXT_FILE_NAME)
}

/// Acquire an execution context for the repository.
///
/// A stored context whose directory still exists is always reused; a new
/// temporary worktree is never allocated while one is stored. Otherwise a
/// detached worktree is created at the trunk head, unless
/// `use_parallel_worktree` is disabled and the active tree is clean, in
/// which case the rebase executes in place.
#[instrument]
pub fn acquire(
    repo: &Repo,
    purpose: &str,
    trunk_head_oid: &NonZeroOid,
    use_parallel_worktree: bool,
) -> Result<ExecutionContext, ContextError> {
    if let Some(stored) = get_stored_context(repo) {
        if stored.execution_path.exists() {
            return Ok(stored);
        }
        warn!(
            path = ?stored.execution_path,
            "stored execution context no longer exists on disk"
        );
        clear_stored_context(repo);
    }

    if !use_parallel_worktree {
        let status = repo.working_tree_status()?;
        if status.is_clean() && !status.is_rebasing {
            return Ok(ExecutionContext {
                execution_path: repo.get_working_copy_path().to_path_buf(),
                is_temporary: false,
                acquired_at_ms: now_ms(),
                purpose: purpose.to_string(),
            });
        }
        return Err(ContextError::WorkingTreeBusy {
            path: repo.get_working_copy_path().to_path_buf(),
        });
    }

    let base_dir = repo.get_git_dir().join("cascade").join("worktrees");
    if let Err(err) = std::fs::create_dir_all(&base_dir) {
        return Err(ContextError::CreationFailed {
            repo_path: repo.get_working_copy_path().to_path_buf(),
            attempts: 0,
            message: err.to_string(),
        });
    }

    let pid = std::process::id();
    let mut last_error = String::new();
    for attempt in 1..=MAX_CREATE_ATTEMPTS {
        let name = format!("{purpose}-{pid}-{}-{attempt}", now_ms());
        let path = base_dir.join(name);
        match repo.worktree_add_detached(&path, trunk_head_oid, WORKTREE_SETUP_TIMEOUT) {
            Ok(()) => {
                return Ok(ExecutionContext {
                    execution_path: path,
                    is_temporary: true,
                    acquired_at_ms: now_ms(),
                    purpose: purpose.to_string(),
                });
            }
            Err(err) => {
                warn!(?path, ?err, attempt, "could not create execution worktree");
                last_error = err.to_string();
                std::thread::sleep(Duration::from_millis(
                    100 * u64::try_from(attempt).unwrap_or(1),
                ));
            }
        }
    }
    Err(ContextError::CreationFailed {
        repo_path: repo.get_working_copy_path().to_path_buf(),
        attempts: MAX_CREATE_ATTEMPTS,
        message: last_error,
    })
}

/// Release an execution context. Temporary worktrees are removed;
/// "already gone" is not an error. Releasing a non-temporary context does
/// nothing.
#[instrument]
pub fn release(repo: &Repo, context: &ExecutionContext) -> Result<(), ContextError> {
    if !context.is_temporary {
        return Ok(());
    }
    repo.worktree_remove(&context.execution_path)?;
    Ok(())
}

/// Persist a context so that the next `acquire` (continue/abort after a
/// suspension) reuses the same tree.
#[instrument]
pub fn store_context(repo: &Repo, context: &ExecutionContext) -> eyre::Result<()> {
    let path = context_path(repo);
    let contents = serde_json::to_string_pretty(context)?;
    write_atomically(&path, &contents)
        .map_err(|err| eyre::eyre!("persisting execution context to {path:?}: {err}"))
}

/// Read the stored context, if a well-formed one exists.
#[instrument]
pub fn get_stored_context(repo: &Repo) -> Option<ExecutionContext> {
    let path = context_path(repo);
    let contents = std::fs::read_to_string(&path).ok()?;
    if contents.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(&contents) {
        Ok(context) => Some(context),
        Err(err) => {
            warn!(?path, ?err, "malformed context record; treating as absent");
            None
        }
    }
}

/// The stored context's execution path, if any.
pub fn get_stored_execution_path(repo: &Repo) -> Option<PathBuf> {
    get_stored_context(repo).map(|context| context.execution_path)
}

/// Durably delete the stored context. Tolerant of corrupt or absent
/// records: the file is rewritten with empty content.
#[instrument]
pub fn clear_stored_context(repo: &Repo) {
    let path = context_path(repo);
    if let Err(err) = write_atomically(&path, "") {
        warn!(?path, ?err, "could not clear stored execution context");
    }
}

/// Whether `candidate` refers to the same directory as `reference`,
/// resolving symlinks where possible.
pub fn is_same_path(candidate: &Path, reference: &Path) -> bool {
    match (
        std::fs::canonicalize(candidate),
        std::fs::canonicalize(reference),
    ) {
        (Ok(lhs), Ok(rhs)) => lhs == rhs,
        _ => candidate == reference,
    }
}
