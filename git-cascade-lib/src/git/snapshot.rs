//! An immutable snapshot of the repository's branches, commits, and
//! worktrees.
//!
//! The pure components of the engine (trunk resolution, stack analysis,
//! intent building, planning) operate on a snapshot rather than on the
//! repository itself, so that they stay deterministic and trivially
//! testable. The snapshot is rebuilt from Git whenever the engine needs a
//! fresh view.

use std::path::PathBuf;

use indexmap::IndexMap;

use super::oid::NonZeroOid;

/// How many commits to load into a snapshot, walking back from all refs.
/// Stacks are expected to be far shallower than this.
pub const SNAPSHOT_COMMIT_LIMIT: usize = 1000;

/// The details of a single commit, as loaded into a snapshot.
///
/// Only the first parent is recorded; stacks are linear, and merge commits
/// are traversed as if they had a single parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitDetails {
    /// The commit's OID.
    pub oid: NonZeroOid,

    /// The commit's first parent, if it is not a root commit.
    pub parent_oid: Option<NonZeroOid>,

    /// The subject line of the commit message.
    pub message: String,

    /// The author, formatted as `Name <email>`.
    pub author: String,

    /// The committer, formatted as `Name <email>`.
    pub committer: String,

    /// The committer timestamp, in milliseconds since the Unix epoch.
    pub time_ms: u64,
}

/// A branch reference as loaded into a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchInfo {
    /// The full reference name, e.g. `refs/heads/main`.
    pub reference_name: String,

    /// The short name, e.g. `main` or `origin/main`.
    pub short_name: String,

    /// The commit the branch points to.
    pub head_oid: NonZeroOid,

    /// Whether this branch has been explicitly designated as the trunk.
    pub is_trunk: bool,

    /// Whether this is a remote-tracking branch.
    pub is_remote: bool,
}

/// A working tree associated with the repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// The worktree's path on disk.
    pub path: PathBuf,

    /// The branch checked out in the worktree, if not detached.
    pub branch: Option<String>,

    /// The commit checked out in the worktree, if any.
    pub head_oid: Option<NonZeroOid>,

    /// Whether the worktree has uncommitted changes to tracked files.
    pub is_dirty: bool,

    /// Whether this is the repository's main worktree.
    pub is_main: bool,

    /// Whether the worktree is locked.
    pub is_locked: bool,
}

/// An immutable view of the repository, consumed by the pure components of
/// the engine.
#[derive(Clone, Debug, Default)]
pub struct RepoSnapshot {
    /// The loaded commits, keyed by OID, in the order Git listed them.
    pub commits: IndexMap<NonZeroOid, CommitDetails>,

    /// All branches, in reference-name order. The order is load-bearing: it
    /// breaks ties deterministically when several branches point to the
    /// same commit.
    pub branches: Vec<BranchInfo>,

    /// The repository's worktrees, main worktree first.
    pub worktrees: Vec<WorktreeInfo>,
}

impl RepoSnapshot {
    /// Find a commit by OID.
    pub fn find_commit(&self, oid: &NonZeroOid) -> Option<&CommitDetails> {
        self.commits.get(oid)
    }

    /// Find a local branch by short name.
    pub fn find_local_branch(&self, short_name: &str) -> Option<&BranchInfo> {
        self.local_branches()
            .find(|branch| branch.short_name == short_name)
    }

    /// Iterate over the local (non-remote-tracking) branches.
    pub fn local_branches(&self) -> impl Iterator<Item = &BranchInfo> {
        self.branches.iter().filter(|branch| !branch.is_remote)
    }
}
