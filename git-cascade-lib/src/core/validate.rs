//! Preconditions checked before a rebase may start.

use std::path::PathBuf;

use thiserror::Error;
use tracing::instrument;

use crate::git::{NonZeroOid, Repo};

use super::context::is_same_path;
use super::intent::RebaseIntent;
use super::session::{get_session, AutoDetachedWorktree};

/// A typed precondition failure. The variants carry enough data for a UI
/// to render a useful message or offer a remediation.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The intent's target list is empty.
    #[error("the rebase request contained no targets")]
    InvalidIntent,

    /// The working tree is already mid-rebase.
    #[error("a rebase is already in progress; continue or abort it first")]
    RebaseInProgress,

    /// No rebase is underway, so there is nothing to continue or skip.
    #[error("no rebase is in progress")]
    RebaseNotInProgress,

    /// A session record already exists for this repository.
    #[error("a rebase session already exists for this repository")]
    SessionExists,

    /// No session record exists for this repository.
    #[error("no rebase session exists for this repository")]
    SessionNotFound,

    /// `HEAD` is not on a branch.
    #[error("HEAD is detached; check out a branch first")]
    DetachedHead,

    /// A branch in the plan no longer resolves.
    #[error("branch {name:?} was not found")]
    BranchNotFound {
        /// The branch's short name.
        name: String,
    },

    /// A branch's head has moved since the plan was built.
    #[error("branch {name:?} has moved since the rebase was planned")]
    BranchMoved {
        /// The branch's short name.
        name: String,
    },

    /// The target base commit does not exist.
    #[error("target base {oid} was not found")]
    TargetNotFound {
        /// The missing commit.
        oid: NonZeroOid,
    },

    /// The branch is already based on the requested target.
    #[error("branch {name:?} is already based on the requested target")]
    SameBase {
        /// The branch's short name.
        name: String,
    },

    /// A target branch is checked out in a dirty worktree elsewhere.
    #[error("branch {name:?} is checked out in a dirty worktree at {path:?}")]
    WorktreeConflict {
        /// The branch's short name.
        name: String,
        /// The offending worktree's path.
        path: PathBuf,
    },

    /// Continue was requested but every conflicted file still carries
    /// markers.
    #[error("conflicts are not resolved yet in: {}", format_paths(paths))]
    UnresolvedConflicts {
        /// The files still carrying conflict markers.
        paths: Vec<PathBuf>,
    },
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ValidationError {
    /// The stable machine-readable code for this failure, for UIs to map
    /// to localized messages.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidIntent => "INVALID_INTENT",
            ValidationError::RebaseInProgress => "REBASE_IN_PROGRESS",
            ValidationError::RebaseNotInProgress => "REBASE_NOT_IN_PROGRESS",
            ValidationError::SessionExists => "SESSION_EXISTS",
            ValidationError::SessionNotFound => "SESSION_NOT_FOUND",
            ValidationError::DetachedHead => "DETACHED_HEAD",
            ValidationError::BranchNotFound { .. } => "BRANCH_NOT_FOUND",
            ValidationError::BranchMoved { .. } => "BRANCH_MOVED",
            ValidationError::TargetNotFound { .. } => "TARGET_NOT_FOUND",
            ValidationError::SameBase { .. } => "SAME_BASE",
            ValidationError::WorktreeConflict { .. } => "WORKTREE_CONFLICT",
            ValidationError::UnresolvedConflicts { .. } => "UNRESOLVED_CONFLICTS",
        }
    }
}

/// What the executor must do before running the plan.
#[derive(Debug, Default)]
pub struct RebasePreparation {
    /// Clean worktrees holding target branches, to be detached and later
    /// restored.
    pub worktrees_to_detach: Vec<AutoDetachedWorktree>,
}

/// Check every precondition for starting a rebase, in order. An expected
/// rejection is a value, not an error; `Err` is reserved for I/O failures
/// talking to Git.
#[instrument(skip(intent))]
pub fn validate_rebase(
    repo: &Repo,
    intent: &RebaseIntent,
) -> eyre::Result<Result<RebasePreparation, ValidationError>> {
    if intent.targets.is_empty() {
        return Ok(Err(ValidationError::InvalidIntent));
    }

    let status = repo.working_tree_status()?;
    if status.is_rebasing {
        return Ok(Err(ValidationError::RebaseInProgress));
    }

    if get_session(repo).is_some() {
        return Ok(Err(ValidationError::SessionExists));
    }

    if repo.current_branch()?.is_none() {
        return Ok(Err(ValidationError::DetachedHead));
    }

    for target in &intent.targets {
        let node = &target.node;
        if !repo.commit_exists(&target.target_base_oid)? {
            return Ok(Err(ValidationError::TargetNotFound {
                oid: target.target_base_oid.clone(),
            }));
        }
        if target.target_base_oid == node.base_oid {
            return Ok(Err(ValidationError::SameBase {
                name: node.branch.clone(),
            }));
        }
        for (branch, head_oid) in node_heads(node) {
            match repo.resolve_ref(branch)? {
                None => {
                    return Ok(Err(ValidationError::BranchNotFound {
                        name: branch.to_string(),
                    }));
                }
                Some(current_head) if current_head != *head_oid => {
                    return Ok(Err(ValidationError::BranchMoved {
                        name: branch.to_string(),
                    }));
                }
                Some(_) => {}
            }
        }
    }

    let target_branches: Vec<&str> = intent.all_branches();
    let mut worktrees_to_detach = Vec::new();
    for worktree in repo.list_worktrees(false)? {
        let branch = match &worktree.branch {
            Some(branch) if target_branches.contains(&branch.as_str()) => branch.clone(),
            _ => continue,
        };
        let is_active = is_same_path(&worktree.path, repo.get_working_copy_path());
        if worktree.is_dirty && !is_active {
            return Ok(Err(ValidationError::WorktreeConflict {
                name: branch,
                path: worktree.path,
            }));
        }
        // Detaching only moves HEAD off the branch name; the files (and
        // any uncommitted changes in the active tree) stay put.
        worktrees_to_detach.push(AutoDetachedWorktree {
            path: worktree.path,
            branch,
        });
    }

    Ok(Ok(RebasePreparation {
        worktrees_to_detach,
    }))
}

fn node_heads(node: &super::intent::StackNode) -> Vec<(&str, &NonZeroOid)> {
    let mut acc = vec![(node.branch.as_str(), &node.head_oid)];
    for child in &node.children {
        acc.extend(node_heads(child));
    }
    acc
}
