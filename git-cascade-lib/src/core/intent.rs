//! Turning a single rebase request into the full tree of branches that
//! must move with it.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::git::{BranchInfo, NonZeroOid, RepoSnapshot};

use super::stack::StackAnalyzer;
use super::trunk::{resolve_trunk, TrunkError};

/// One branch in an intent's target tree, together with the branches
/// stacked on top of it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackNode {
    /// The branch's short name.
    pub branch: String,

    /// The branch's head commit at the time the intent was built.
    pub head_oid: NonZeroOid,

    /// The commit the branch was based on at the time the intent was
    /// built.
    pub base_oid: NonZeroOid,

    /// The commits the branch contributes over its base, oldest first.
    pub owned_oids: Vec<NonZeroOid>,

    /// The branches stacked directly on top of this one.
    pub children: Vec<StackNode>,
}

impl StackNode {
    /// Find the node for the given branch in this subtree.
    pub fn find(&self, branch: &str) -> Option<&StackNode> {
        if self.branch == branch {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(branch))
    }

    /// Every branch in this subtree, parents before children.
    pub fn branches(&self) -> Vec<&str> {
        let mut acc = vec![self.branch.as_str()];
        for child in &self.children {
            acc.extend(child.branches());
        }
        acc
    }
}

/// One (branch subtree, new base) pair inside an intent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebaseTarget {
    /// The subtree of branches to move.
    pub node: StackNode,

    /// The commit the subtree's root should be rebased onto. Descendants
    /// inherit their target dynamically, from their parent's new head.
    pub target_base_oid: NonZeroOid,
}

/// A user-submitted rebase request, expanded to the full set of branches
/// that must move. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebaseIntent {
    /// A unique id for the intent.
    pub id: String,

    /// When the intent was created, in milliseconds since the Unix epoch.
    pub created_at_ms: u64,

    /// The target subtrees to move, in declaration order.
    pub targets: Vec<RebaseTarget>,
}

impl RebaseIntent {
    /// Find the node for the given branch across all targets.
    pub fn find_node(&self, branch: &str) -> Option<&StackNode> {
        self.targets
            .iter()
            .find_map(|target| target.node.find(branch))
    }

    /// Every branch the intent touches, parents before children.
    pub fn all_branches(&self) -> Vec<&str> {
        self.targets
            .iter()
            .flat_map(|target| target.node.branches())
            .collect()
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum IntentError {
    #[error("no branch has its head at {oid}, or it is the trunk")]
    InvalidHead { oid: NonZeroOid },

    #[error("target base {oid} was not found in the repository")]
    TargetNotFound { oid: NonZeroOid },

    #[error("could not determine the base of branch {branch:?}")]
    CannotDetermineBase { branch: String },

    #[error(transparent)]
    Trunk(#[from] TrunkError),
}

/// Build the intent for moving the branch whose head is `head_oid` onto
/// `new_base_oid`.
///
/// Returns `Ok(None)` when there is nothing to do: the branch is already
/// based on `new_base_oid`, or `new_base_oid` is an ancestor of the
/// current base (so the branch's commits already sit on top of it).
#[instrument(skip(snapshot))]
pub fn build_rebase_intent(
    snapshot: &RepoSnapshot,
    head_oid: &NonZeroOid,
    new_base_oid: &NonZeroOid,
    now_ms: u64,
) -> Result<Option<RebaseIntent>, IntentError> {
    let trunk = resolve_trunk(snapshot)?;
    if trunk.head_oid == *head_oid {
        return Err(IntentError::InvalidHead {
            oid: head_oid.clone(),
        });
    }

    let analyzer = StackAnalyzer::new(snapshot, &trunk);
    let branch = analyzer
        .owner_of_head(head_oid)
        .ok_or_else(|| IntentError::InvalidHead {
            oid: head_oid.clone(),
        })?;
    if branch.is_trunk || branch.short_name == trunk.branch_name {
        return Err(IntentError::InvalidHead {
            oid: head_oid.clone(),
        });
    }

    if snapshot.find_commit(new_base_oid).is_none() {
        return Err(IntentError::TargetNotFound {
            oid: new_base_oid.clone(),
        });
    }

    let range = analyzer.owned_range(branch);
    let base_oid = range
        .base_oid
        .clone()
        .ok_or_else(|| IntentError::CannotDetermineBase {
            branch: branch.short_name.clone(),
        })?;

    if base_oid == *new_base_oid {
        return Ok(None);
    }
    if is_first_parent_ancestor(snapshot, new_base_oid, &base_oid) {
        return Ok(None);
    }

    let mut seen = IndexSet::new();
    let node = build_node(&analyzer, branch, &mut seen).ok_or_else(|| {
        IntentError::CannotDetermineBase {
            branch: branch.short_name.clone(),
        }
    })?;

    Ok(Some(RebaseIntent {
        id: format!("intent-{now_ms}"),
        created_at_ms: now_ms,
        targets: vec![RebaseTarget {
            node,
            target_base_oid: new_base_oid.clone(),
        }],
    }))
}

fn build_node(
    analyzer: &StackAnalyzer<'_>,
    branch: &BranchInfo,
    seen: &mut IndexSet<String>,
) -> Option<StackNode> {
    if !seen.insert(branch.short_name.clone()) {
        warn!(branch = %branch.short_name, "branch already appears in the target tree");
        return None;
    }
    let range = analyzer.owned_range(branch);
    let base_oid = range.base_oid?;
    let children = analyzer
        .direct_children(branch)
        .into_iter()
        .filter_map(|child| build_node(analyzer, child, seen))
        .collect();
    Some(StackNode {
        branch: branch.short_name.clone(),
        head_oid: branch.head_oid.clone(),
        base_oid,
        owned_oids: range.owned_oids,
        children,
    })
}

/// Whether `needle` lies on the first-parent history of `haystack`.
fn is_first_parent_ancestor(
    snapshot: &RepoSnapshot,
    needle: &NonZeroOid,
    haystack: &NonZeroOid,
) -> bool {
    let mut visited = IndexSet::new();
    let mut cursor = Some(haystack.clone());
    while let Some(oid) = cursor {
        if !visited.insert(oid.clone()) {
            return false;
        }
        if oid == *needle {
            return true;
        }
        cursor = snapshot
            .find_commit(&oid)
            .and_then(|commit| commit.parent_oid.clone());
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::snapshots::{test_oid, SnapshotBuilder};

    fn oids(chars: &[char]) -> Vec<NonZeroOid> {
        chars.iter().copied().map(test_oid).collect()
    }

    // main: a, then d appended; feature-1: a-b; feature-2: a-b-c.
    fn cascade_snapshot() -> crate::git::RepoSnapshot {
        SnapshotBuilder::new()
            .commit('a', None)
            .commit('b', Some('a'))
            .commit('c', Some('b'))
            .commit('d', Some('a'))
            .branch("main", 'd')
            .branch("feature-1", 'b')
            .branch("feature-2", 'c')
            .build()
    }

    #[test]
    fn test_single_child_cascade() {
        let snapshot = cascade_snapshot();
        let intent = build_rebase_intent(&snapshot, &test_oid('b'), &test_oid('d'), 1_000)
            .unwrap()
            .unwrap();

        assert_eq!(intent.targets.len(), 1);
        let target = &intent.targets[0];
        assert_eq!(target.target_base_oid, test_oid('d'));

        let root = &target.node;
        assert_eq!(root.branch, "feature-1");
        assert_eq!(root.head_oid, test_oid('b'));
        assert_eq!(root.base_oid, test_oid('a'));
        assert_eq!(root.owned_oids, oids(&['b']));

        assert_eq!(root.children.len(), 1);
        let child = &root.children[0];
        assert_eq!(child.branch, "feature-2");
        assert_eq!(child.base_oid, test_oid('b'));
        assert_eq!(child.owned_oids, oids(&['c']));
        assert_eq!(child.children, Vec::new());

        assert_eq!(intent.all_branches(), vec!["feature-1", "feature-2"]);
        assert_eq!(intent.find_node("feature-2").unwrap().branch, "feature-2");
        assert_eq!(intent.find_node("nope"), None);
    }

    #[test]
    fn test_multiple_children() {
        let snapshot = SnapshotBuilder::new()
            .commit('a', None)
            .commit('b', Some('a'))
            .commit('c', Some('b'))
            .commit('d', Some('b'))
            .commit('e', Some('a'))
            .branch("main", 'e')
            .branch("parent", 'b')
            .branch("child-1", 'c')
            .branch("child-2", 'd')
            .build();
        let intent = build_rebase_intent(&snapshot, &test_oid('b'), &test_oid('e'), 1_000)
            .unwrap()
            .unwrap();
        let root = &intent.targets[0].node;
        assert_eq!(root.branch, "parent");
        let children: Vec<&str> = root
            .children
            .iter()
            .map(|child| child.branch.as_str())
            .collect();
        assert_eq!(children, vec!["child-1", "child-2"]);
    }

    #[test]
    fn test_same_base_is_a_no_op() {
        let snapshot = cascade_snapshot();
        // feature-1 is already based on a.
        let intent =
            build_rebase_intent(&snapshot, &test_oid('b'), &test_oid('a'), 1_000).unwrap();
        assert_eq!(intent, None);
    }

    #[test]
    fn test_new_base_behind_current_base_is_a_no_op() {
        // main: a-b; feature: a-b-c. Moving feature onto a would change
        // nothing it owns: a is already part of its history.
        let snapshot = SnapshotBuilder::new()
            .commit('a', None)
            .commit('b', Some('a'))
            .commit('c', Some('b'))
            .branch("main", 'b')
            .branch("feature", 'c')
            .build();
        let intent =
            build_rebase_intent(&snapshot, &test_oid('c'), &test_oid('a'), 1_000).unwrap();
        assert_eq!(intent, None);
    }

    #[test]
    fn test_invalid_head() {
        let snapshot = cascade_snapshot();
        // No branch has its head at a.
        let result = build_rebase_intent(&snapshot, &test_oid('a'), &test_oid('d'), 1_000);
        assert!(matches!(result, Err(IntentError::InvalidHead { .. })));

        // The trunk head is not a valid head to move.
        let result = build_rebase_intent(&snapshot, &test_oid('d'), &test_oid('a'), 1_000);
        assert!(matches!(result, Err(IntentError::InvalidHead { .. })));
    }

    #[test]
    fn test_target_not_found() {
        let snapshot = cascade_snapshot();
        let result = build_rebase_intent(&snapshot, &test_oid('b'), &test_oid('9'), 1_000);
        assert!(matches!(result, Err(IntentError::TargetNotFound { .. })));
    }
}
