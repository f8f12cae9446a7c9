//! Branch operations guarded by trunk protection.
//!
//! Deleting, renaming, and cleaning up branches all refuse to touch a
//! protected trunk name, regardless of what the caller asks for. Deletion
//! also tears down the branch's remote presence: its pull request is
//! closed and its remote-tracking ref removed, when they exist.

use thiserror::Error;
use tracing::{instrument, warn};

use crate::git::{Repo, RepoSnapshot};

use super::pr::Forge;
use super::trunk::{is_protected_branch_name, resolve_trunk, TrunkError};

/// The remote whose tracking refs are considered when deleting a branch.
const DEFAULT_REMOTE: &str = "origin";

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum BranchOpError {
    #[error("{name:?} is a protected trunk name and cannot be deleted, renamed, or cleaned up")]
    ProtectedBranch { name: String },

    #[error("branch {name:?} was not found")]
    BranchNotFound { name: String },

    #[error(transparent)]
    Trunk(#[from] TrunkError),

    #[error(transparent)]
    Git(#[from] crate::git::RepoError),
}

/// Delete a local branch, closing its pull request and removing its
/// remote-tracking ref when they exist. Protected trunk names are refused.
#[instrument(skip(snapshot, forge))]
pub fn delete_branch(
    repo: &Repo,
    snapshot: &RepoSnapshot,
    name: &str,
    forge: Option<&dyn Forge>,
) -> Result<(), BranchOpError> {
    if is_protected_branch_name(name) {
        return Err(BranchOpError::ProtectedBranch {
            name: name.to_string(),
        });
    }
    if snapshot.find_local_branch(name).is_none() {
        return Err(BranchOpError::BranchNotFound {
            name: name.to_string(),
        });
    }

    if let Some(forge) = forge {
        if let Err(err) = forge.close_pull_request(name) {
            warn!(branch = name, ?err, "could not close pull request");
        }
    }

    let remote_name = format!("{DEFAULT_REMOTE}/{name}");
    let has_remote_tracking = snapshot
        .branches
        .iter()
        .any(|branch| branch.is_remote && branch.short_name == remote_name);
    if has_remote_tracking {
        repo.delete_remote_tracking_branch(DEFAULT_REMOTE, name)?;
        if let Some(forge) = forge {
            if let Err(err) = forge.delete_remote_branch(DEFAULT_REMOTE, name) {
                warn!(branch = name, ?err, "could not delete remote branch");
            }
        }
    }

    repo.delete_branch(name)?;
    Ok(())
}

/// Rename a local branch. Protected trunk names are refused.
#[instrument]
pub fn rename_branch(repo: &Repo, old_name: &str, new_name: &str) -> Result<(), BranchOpError> {
    if is_protected_branch_name(old_name) {
        return Err(BranchOpError::ProtectedBranch {
            name: old_name.to_string(),
        });
    }
    repo.rename_branch(old_name, new_name)?;
    Ok(())
}

/// Delete every local branch fully merged into the trunk (its merge-base
/// with the trunk head is its own head). Protected names, the trunk
/// itself, and branches checked out in any worktree are left alone.
/// Returns the names of the deleted branches.
#[instrument(skip(snapshot, forge))]
pub fn cleanup_merged_branches(
    repo: &Repo,
    snapshot: &RepoSnapshot,
    forge: Option<&dyn Forge>,
) -> Result<Vec<String>, BranchOpError> {
    let trunk = resolve_trunk(snapshot)?;
    let checked_out: Vec<&str> = snapshot
        .worktrees
        .iter()
        .filter_map(|worktree| worktree.branch.as_deref())
        .collect();

    let mut deleted = Vec::new();
    for branch in snapshot.local_branches() {
        let name = branch.short_name.as_str();
        if name == trunk.branch_name
            || branch.is_trunk
            || is_protected_branch_name(name)
            || checked_out.contains(&name)
        {
            continue;
        }
        let merge_base = repo.find_merge_base(&trunk.head_oid, &branch.head_oid)?;
        if merge_base.as_ref() != Some(&branch.head_oid) {
            continue;
        }
        delete_branch(repo, snapshot, name, forge)?;
        deleted.push(name.to_string());
    }
    Ok(deleted)
}
