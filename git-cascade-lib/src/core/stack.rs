//! Inferring parent/child relationships between branches from the commit
//! graph alone.
//!
//! Stacks are assumed linear: ancestry walks follow first-parent links
//! only, and merge commits are traversed as if they had a single parent.
//! Malformed input could contain parent cycles, so every walk carries a
//! visited set.

use std::collections::{HashMap, HashSet};

use indexmap::IndexSet;

use crate::git::{BranchInfo, NonZeroOid, RepoSnapshot};

use super::trunk::Trunk;

/// The commit range a branch contributes over its base.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnedRange {
    /// The commit the branch is based on: the nearest ancestor which is
    /// another branch's head or lies on the trunk. `None` if the walk ran
    /// off the end of the loaded graph.
    pub base_oid: Option<NonZeroOid>,

    /// The commits the branch owns, oldest first.
    pub owned_oids: Vec<NonZeroOid>,
}

/// Analyzes the branch structure of a snapshot relative to its trunk.
pub struct StackAnalyzer<'a> {
    snapshot: &'a RepoSnapshot,
    trunk_branch_name: String,
    trunk_ancestry: IndexSet<NonZeroOid>,
    owner_by_head: HashMap<NonZeroOid, &'a BranchInfo>,
}

impl<'a> StackAnalyzer<'a> {
    /// Build an analyzer for the given snapshot.
    pub fn new(snapshot: &'a RepoSnapshot, trunk: &Trunk) -> Self {
        let mut trunk_ancestry = IndexSet::new();
        let mut cursor = Some(trunk.head_oid.clone());
        while let Some(oid) = cursor {
            if !trunk_ancestry.insert(oid.clone()) {
                break;
            }
            cursor = snapshot
                .find_commit(&oid)
                .and_then(|commit| commit.parent_oid.clone());
        }

        // When several branches share a head commit, exactly one of them
        // owns it: the trunk if present, otherwise the first by snapshot
        // insertion order, which is deterministic across runs.
        let mut owner_by_head: HashMap<NonZeroOid, &BranchInfo> = HashMap::new();
        for branch in snapshot.local_branches() {
            owner_by_head
                .entry(branch.head_oid.clone())
                .and_modify(|owner| {
                    if branch.short_name == trunk.branch_name && !owner.is_trunk {
                        *owner = branch;
                    }
                })
                .or_insert(branch);
        }
        if let Some(trunk_branch) = snapshot.find_local_branch(&trunk.branch_name) {
            owner_by_head.insert(trunk_branch.head_oid.clone(), trunk_branch);
        }

        StackAnalyzer {
            snapshot,
            trunk_branch_name: trunk.branch_name.clone(),
            trunk_ancestry,
            owner_by_head,
        }
    }

    /// The branch which owns the given commit as its head, if any.
    pub fn owner_of_head(&self, oid: &NonZeroOid) -> Option<&'a BranchInfo> {
        self.owner_by_head.get(oid).copied()
    }

    /// Whether the commit lies on the trunk's first-parent history.
    pub fn is_on_trunk(&self, oid: &NonZeroOid) -> bool {
        self.trunk_ancestry.contains(oid)
    }

    /// Compute the commit range the given branch owns over its base.
    pub fn owned_range(&self, branch: &BranchInfo) -> OwnedRange {
        let head = &branch.head_oid;

        // A branch which does not own its own head commit (it shares the
        // head with an earlier branch, or points into the trunk) owns
        // nothing.
        let owns_head = match self.owner_of_head(head) {
            Some(owner) => owner.reference_name == branch.reference_name,
            None => true,
        };
        if !owns_head || self.is_on_trunk(head) {
            return OwnedRange {
                base_oid: Some(head.clone()),
                owned_oids: Vec::new(),
            };
        }

        let mut owned_oids = vec![head.clone()];
        let mut visited: HashSet<NonZeroOid> = owned_oids.iter().cloned().collect();
        let mut cursor = self
            .snapshot
            .find_commit(head)
            .and_then(|commit| commit.parent_oid.clone());
        let mut base_oid = None;
        while let Some(oid) = cursor {
            if !visited.insert(oid.clone()) {
                break;
            }
            if self.is_on_trunk(&oid) || self.owner_of_head(&oid).is_some() {
                base_oid = Some(oid);
                break;
            }
            cursor = self
                .snapshot
                .find_commit(&oid)
                .and_then(|commit| commit.parent_oid.clone());
            owned_oids.push(oid);
        }
        owned_oids.reverse();
        OwnedRange {
            base_oid,
            owned_oids,
        }
    }

    /// The branches directly stacked on top of the given branch: those
    /// whose first-parent path towards the trunk reaches `parent`'s head
    /// without crossing another branch head first.
    pub fn direct_children(&self, parent: &BranchInfo) -> Vec<&'a BranchInfo> {
        self.snapshot
            .local_branches()
            .filter(|branch| {
                branch.reference_name != parent.reference_name
                    && !branch.is_trunk
                    && branch.short_name != self.trunk_branch_name
                    && self.owned_range(branch).base_oid.as_ref() == Some(&parent.head_oid)
            })
            .collect()
    }
}
