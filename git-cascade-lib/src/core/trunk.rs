//! Identifying the trunk branch.
//!
//! The trunk is the integration branch a stack is ultimately rooted at.
//! The following candidates are resolved, in order. The first match wins.
//!
//! - A local branch explicitly flagged as trunk (via the `cascade.trunk`
//!   config key).
//! - The first local branch whose name is a trunk candidate, in candidate
//!   precedence order.
//! - A remote-tracking branch for a candidate name, in the same order.

use thiserror::Error;
use tracing::instrument;

use crate::git::{BranchInfo, NonZeroOid, RepoSnapshot};

/// Branch names which may serve as the trunk, in precedence order. These
/// names are also protected: they cannot be deleted, renamed, or cleaned
/// up.
pub const TRUNK_CANDIDATES: &[&str] = &["main", "master", "develop", "trunk"];

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum TrunkError {
    #[error("could not determine the trunk branch; expected one of: {}", TRUNK_CANDIDATES.join(", "))]
    NotFound,
}

/// The resolved trunk branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trunk {
    /// The short name of the trunk branch, e.g. `main` or `origin/main`.
    pub branch_name: String,

    /// The trunk-head OID.
    pub head_oid: NonZeroOid,
}

/// Whether the given short branch name is protected from deletion, rename,
/// and cleanup. The comparison is case-insensitive.
pub fn is_protected_branch_name(name: &str) -> bool {
    let name = name.to_lowercase();
    TRUNK_CANDIDATES.iter().any(|candidate| *candidate == name)
}

fn candidate_rank(short_name: &str) -> Option<usize> {
    let short_name = short_name.to_lowercase();
    TRUNK_CANDIDATES
        .iter()
        .position(|candidate| *candidate == short_name)
}

/// Select the trunk branch from a snapshot.
#[instrument(skip(snapshot))]
pub fn resolve_trunk(snapshot: &RepoSnapshot) -> Result<Trunk, TrunkError> {
    if let Some(branch) = snapshot.local_branches().find(|branch| branch.is_trunk) {
        return Ok(trunk_of(branch));
    }

    let local_candidate = snapshot
        .local_branches()
        .filter_map(|branch| candidate_rank(&branch.short_name).map(|rank| (rank, branch)))
        .min_by_key(|(rank, _)| *rank);
    if let Some((_, branch)) = local_candidate {
        return Ok(trunk_of(branch));
    }

    let remote_candidate = snapshot
        .branches
        .iter()
        .filter(|branch| branch.is_remote)
        .filter_map(|branch| {
            let (_, name) = branch.short_name.split_once('/')?;
            candidate_rank(name).map(|rank| (rank, branch))
        })
        .min_by_key(|(rank, _)| *rank);
    if let Some((_, branch)) = remote_candidate {
        return Ok(trunk_of(branch));
    }

    Err(TrunkError::NotFound)
}

fn trunk_of(branch: &BranchInfo) -> Trunk {
    Trunk {
        branch_name: branch.short_name.clone(),
        head_oid: branch.head_oid.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::snapshots::{test_oid, SnapshotBuilder};

    #[test]
    fn test_explicit_trunk_flag_wins() {
        let snapshot = SnapshotBuilder::new()
            .commit('a', None)
            .commit('b', Some('a'))
            .trunk_branch("integration", 'b')
            .branch("main", 'a')
            .build();
        let trunk = resolve_trunk(&snapshot).unwrap();
        assert_eq!(trunk.branch_name, "integration");
        assert_eq!(trunk.head_oid, test_oid('b'));
    }

    #[test]
    fn test_candidate_precedence() {
        let snapshot = SnapshotBuilder::new()
            .commit('a', None)
            .branch("develop", 'a')
            .branch("master", 'a')
            .build();
        assert_eq!(resolve_trunk(&snapshot).unwrap().branch_name, "master");

        let snapshot = SnapshotBuilder::new()
            .commit('a', None)
            .branch("MAIN", 'a')
            .branch("master", 'a')
            .build();
        assert_eq!(resolve_trunk(&snapshot).unwrap().branch_name, "MAIN");
    }

    #[test]
    fn test_remote_tracking_fallback() {
        let snapshot = SnapshotBuilder::new()
            .commit('a', None)
            .branch("feature", 'a')
            .remote_branch("origin/main", 'a')
            .build();
        assert_eq!(resolve_trunk(&snapshot).unwrap().branch_name, "origin/main");
    }

    #[test]
    fn test_no_trunk() {
        let snapshot = SnapshotBuilder::new()
            .commit('a', None)
            .branch("feature", 'a')
            .build();
        assert!(matches!(resolve_trunk(&snapshot), Err(TrunkError::NotFound)));
    }

    #[test]
    fn test_protected_branch_names() {
        assert!(is_protected_branch_name("main"));
        assert!(is_protected_branch_name("Master"));
        assert!(is_protected_branch_name("TRUNK"));
        assert!(!is_protected_branch_name("feature"));
        assert!(!is_protected_branch_name("main-backup"));
    }
}
