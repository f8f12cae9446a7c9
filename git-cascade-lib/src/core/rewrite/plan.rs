//! The rebase plan and its state machine.
//!
//! Everything here is a pure transition over [`RebaseState`]: no I/O, no
//! clocks, no Git. The executor owns all of those and feeds results back in.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::core::intent::{RebaseIntent, StackNode};
use crate::core::trunk::{resolve_trunk, TrunkError};
use crate::git::{NonZeroOid, RepoSnapshot};

/// The lifecycle of a single per-branch rebase job.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    /// Queued, not yet started.
    Pending,

    /// Currently being executed.
    InProgress,

    /// Paused on conflicts, waiting for the user to resolve them.
    AwaitingUser,

    /// Finished; its rewrites have been recorded.
    Completed,

    /// Could not run; its subtree was dropped.
    Failed,

    /// Finished, but every owned commit was dropped during replay.
    Skipped,
}

/// A single pre/post pairing produced by replaying one commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRewrite {
    /// The branch whose commit was replayed.
    pub branch: String,

    /// The commit as it was before the rebase.
    pub old_oid: NonZeroOid,

    /// The commit as it is after the rebase.
    pub new_oid: NonZeroOid,
}

/// The conflicted state snapshotted when a job pauses for the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSnapshot {
    /// The files left in a conflicted state.
    pub conflicted_paths: Vec<PathBuf>,

    /// When the conflict was recorded, in milliseconds since the Unix
    /// epoch.
    pub recorded_at_ms: u64,
}

/// The atomic per-branch rebase unit executed by the queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebaseJob {
    /// A unique id for the job.
    pub id: String,

    /// The branch to rebase.
    pub branch: String,

    /// The branch's base before the rebase.
    pub original_base_oid: NonZeroOid,

    /// The branch's head before the rebase.
    pub original_head_oid: NonZeroOid,

    /// The commit to replay the branch's owned commits onto.
    pub target_base_oid: NonZeroOid,

    /// Where the job is in its lifecycle.
    pub status: JobStatus,

    /// When the job was enqueued, in milliseconds since the Unix epoch.
    pub created_at_ms: u64,

    /// The rewrites recorded when the job completed.
    pub rewrites: Vec<CommitRewrite>,

    /// The conflicted state, if the job is (or was) paused on conflicts.
    pub conflict: Option<ConflictSnapshot>,

    /// Why the job failed, if it did.
    pub error: Option<String>,
}

/// The queue of jobs. At most one job is active at a time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebaseQueue {
    /// Ids of jobs not yet started, in execution order.
    pub pending_job_ids: Vec<String>,

    /// The id of the job currently in progress or awaiting the user.
    pub active_job_id: Option<String>,
}

/// The overall status of a rebase session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    /// Jobs are executing.
    Running,

    /// Paused on conflicts.
    AwaitingUser,

    /// All jobs have finished.
    Completed,

    /// The user aborted.
    Aborted,
}

/// Session-level bookkeeping for a rebase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebaseSessionMeta {
    /// A unique id for the session.
    pub id: String,

    /// When the session started, in milliseconds since the Unix epoch.
    pub started_at_ms: u64,

    /// The session's overall status.
    pub status: SessionStatus,

    /// The trunk-head OID captured when the plan was built.
    pub initial_trunk_oid: NonZeroOid,

    /// Every rewrite recorded so far, append-only, in replay order.
    pub commit_map: Vec<CommitRewrite>,
}

/// The full mutable state of a rebase: session bookkeeping, all jobs, and
/// the queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebaseState {
    /// Session-level bookkeeping.
    pub session: RebaseSessionMeta,

    /// Every job ever enqueued, keyed by id, in enqueue order.
    pub jobs_by_id: IndexMap<String, RebaseJob>,

    /// The execution queue.
    pub queue: RebaseQueue,
}

/// Generates unique job ids within one session.
#[derive(Debug)]
pub struct JobIdGenerator {
    counter: usize,
}

impl JobIdGenerator {
    /// A generator for a fresh session.
    pub fn new() -> Self {
        JobIdGenerator { counter: 0 }
    }

    /// A generator which continues from the jobs already present in
    /// `state`, for use when resuming a session.
    pub fn resuming(state: &RebaseState) -> Self {
        JobIdGenerator {
            counter: state.jobs_by_id.len(),
        }
    }

    /// Produce the next job id.
    pub fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("job-{}", self.counter)
    }
}

impl Default for JobIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("the rebase request contained no targets")]
    EmptyIntent,

    #[error("branch {name:?} appears more than once in the plan")]
    DuplicateBranch { name: String },

    #[error("branch {name:?} does not exist in the repository snapshot")]
    BranchNotFound { name: String },

    #[error("no job with id {id:?}")]
    UnknownJob { id: String },

    #[error("job {id:?} cannot make this transition from state {status:?}")]
    IllegalTransition { id: String, status: JobStatus },

    #[error(transparent)]
    Trunk(#[from] TrunkError),
}

/// Produce the initial state for executing an intent.
///
/// One job is enqueued per root target, in declaration order. Jobs for
/// child branches are *not* pre-enqueued: they are appended when their
/// parent completes, so that each child's target base reflects the parent's
/// actual new head.
#[instrument(skip(snapshot, intent))]
pub fn create_rebase_plan(
    snapshot: &RepoSnapshot,
    intent: &RebaseIntent,
    ids: &mut JobIdGenerator,
    now_ms: u64,
) -> Result<RebaseState, PlanError> {
    if intent.targets.is_empty() {
        return Err(PlanError::EmptyIntent);
    }

    let trunk = resolve_trunk(snapshot)?;

    let mut jobs_by_id: IndexMap<String, RebaseJob> = IndexMap::new();
    let mut pending_job_ids = Vec::new();
    for target in &intent.targets {
        let node = &target.node;
        // Only the root target's branch must still exist here. Descendants
        // are checked per job at execution time, when a vanished branch
        // fails its own job and drops its subtree without blocking the
        // rest of the plan.
        if snapshot.find_local_branch(&node.branch).is_none() {
            return Err(PlanError::BranchNotFound {
                name: node.branch.clone(),
            });
        }
        if jobs_by_id.values().any(|job| job.branch == node.branch) {
            return Err(PlanError::DuplicateBranch {
                name: node.branch.clone(),
            });
        }
        let job = RebaseJob {
            id: ids.next_id(),
            branch: node.branch.clone(),
            original_base_oid: node.base_oid.clone(),
            original_head_oid: node.head_oid.clone(),
            target_base_oid: target.target_base_oid.clone(),
            status: JobStatus::Pending,
            created_at_ms: now_ms,
            rewrites: Vec::new(),
            conflict: None,
            error: None,
        };
        pending_job_ids.push(job.id.clone());
        jobs_by_id.insert(job.id.clone(), job);
    }

    Ok(RebaseState {
        session: RebaseSessionMeta {
            id: format!("session-{now_ms}"),
            started_at_ms: now_ms,
            status: SessionStatus::Running,
            initial_trunk_oid: trunk.head_oid,
            commit_map: Vec::new(),
        },
        jobs_by_id,
        queue: RebaseQueue {
            pending_job_ids,
            active_job_id: None,
        },
    })
}

impl RebaseState {
    /// The job currently in progress or awaiting the user, if any.
    pub fn active_job(&self) -> Option<&RebaseJob> {
        let id = self.queue.active_job_id.as_ref()?;
        self.jobs_by_id.get(id)
    }

    fn job_mut(&mut self, id: &str) -> Result<&mut RebaseJob, PlanError> {
        self.jobs_by_id
            .get_mut(id)
            .ok_or_else(|| PlanError::UnknownJob { id: id.to_string() })
    }

    /// Promote the next pending job to in-progress and mark it active.
    /// Returns `None` when the queue is empty, or when another job is
    /// already active.
    pub fn next_job(&mut self, _now_ms: u64) -> Option<RebaseJob> {
        if self.queue.active_job_id.is_some() {
            return None;
        }
        let id = if self.queue.pending_job_ids.is_empty() {
            return None;
        } else {
            self.queue.pending_job_ids.remove(0)
        };
        let job = self.jobs_by_id.get_mut(&id)?;
        job.status = JobStatus::InProgress;
        self.queue.active_job_id = Some(id);
        self.session.status = SessionStatus::Running;
        self.active_job().cloned()
    }

    /// Pause the given job on conflicts and snapshot the conflicted files.
    pub fn record_conflict(
        &mut self,
        job_id: &str,
        conflicted_paths: Vec<PathBuf>,
        now_ms: u64,
    ) -> Result<(), PlanError> {
        let job = self.job_mut(job_id)?;
        match job.status {
            JobStatus::InProgress | JobStatus::AwaitingUser => {}
            status => {
                return Err(PlanError::IllegalTransition {
                    id: job_id.to_string(),
                    status,
                })
            }
        }
        job.status = JobStatus::AwaitingUser;
        job.conflict = Some(ConflictSnapshot {
            conflicted_paths,
            recorded_at_ms: now_ms,
        });
        self.session.status = SessionStatus::AwaitingUser;
        Ok(())
    }

    /// Record that the given job finished, along with the rewrites its
    /// replay produced.
    pub fn complete_job(
        &mut self,
        job_id: &str,
        rewrites: Vec<CommitRewrite>,
        _now_ms: u64,
    ) -> Result<(), PlanError> {
        self.finish_job(job_id, rewrites, JobStatus::Completed)
    }

    /// Record that the given job finished with every owned commit dropped.
    pub fn mark_skipped(&mut self, job_id: &str, _now_ms: u64) -> Result<(), PlanError> {
        self.finish_job(job_id, Vec::new(), JobStatus::Skipped)
    }

    fn finish_job(
        &mut self,
        job_id: &str,
        rewrites: Vec<CommitRewrite>,
        status: JobStatus,
    ) -> Result<(), PlanError> {
        let job = self.job_mut(job_id)?;
        match job.status {
            JobStatus::InProgress | JobStatus::AwaitingUser => {}
            status => {
                return Err(PlanError::IllegalTransition {
                    id: job_id.to_string(),
                    status,
                })
            }
        }
        job.status = status;
        job.rewrites = rewrites.clone();
        for rewrite in rewrites {
            let duplicate = self
                .session
                .commit_map
                .iter()
                .any(|existing| {
                    existing.branch == rewrite.branch && existing.old_oid == rewrite.old_oid
                });
            if !duplicate {
                self.session.commit_map.push(rewrite);
            }
        }
        if self.queue.active_job_id.as_deref() == Some(job_id) {
            self.queue.active_job_id = None;
        }
        self.session.status = SessionStatus::Running;
        Ok(())
    }

    /// Record that the given job could not run. Its descendants are never
    /// enqueued, which drops the subtree from the queue.
    pub fn fail_job(
        &mut self,
        job_id: &str,
        error: String,
        _now_ms: u64,
    ) -> Result<(), PlanError> {
        let job = self.job_mut(job_id)?;
        job.status = JobStatus::Failed;
        job.error = Some(error);
        if self.queue.active_job_id.as_deref() == Some(job_id) {
            self.queue.active_job_id = None;
        }
        self.session.status = SessionStatus::Running;
        Ok(())
    }

    /// Enqueue a job for each child of `parent_node`, targeting the
    /// parent's new head. Returns the new job ids, in order.
    pub fn enqueue_descendants(
        &mut self,
        parent_node: &StackNode,
        parent_new_head_oid: &NonZeroOid,
        ids: &mut JobIdGenerator,
        now_ms: u64,
    ) -> Result<Vec<String>, PlanError> {
        let mut enqueued = Vec::new();
        for child in &parent_node.children {
            if self
                .jobs_by_id
                .values()
                .any(|job| job.branch == child.branch)
            {
                return Err(PlanError::DuplicateBranch {
                    name: child.branch.clone(),
                });
            }
            let job = RebaseJob {
                id: ids.next_id(),
                branch: child.branch.clone(),
                original_base_oid: parent_node.head_oid.clone(),
                original_head_oid: child.head_oid.clone(),
                target_base_oid: parent_new_head_oid.clone(),
                status: JobStatus::Pending,
                created_at_ms: now_ms,
                rewrites: Vec::new(),
                conflict: None,
                error: None,
            };
            self.queue.pending_job_ids.push(job.id.clone());
            enqueued.push(job.id.clone());
            self.jobs_by_id.insert(job.id.clone(), job);
        }
        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::intent::build_rebase_intent;
    use crate::testing::snapshots::{test_oid, SnapshotBuilder};

    // main: a, then e appended; parent: a-b; child-1: a-b-c; child-2:
    // a-b-d.
    fn snapshot_and_intent() -> (RepoSnapshot, RebaseIntent) {
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
        (snapshot, intent)
    }

    #[test]
    fn test_create_plan_enqueues_only_roots() {
        let (snapshot, intent) = snapshot_and_intent();
        let mut ids = JobIdGenerator::new();
        let state = create_rebase_plan(&snapshot, &intent, &mut ids, 1_000).unwrap();

        assert_eq!(state.session.status, SessionStatus::Running);
        assert_eq!(state.session.initial_trunk_oid, test_oid('e'));
        assert_eq!(state.session.commit_map, Vec::new());
        assert_eq!(state.jobs_by_id.len(), 1);
        let job = &state.jobs_by_id["job-1"];
        assert_eq!(job.branch, "parent");
        assert_eq!(job.original_base_oid, test_oid('a'));
        assert_eq!(job.original_head_oid, test_oid('b'));
        assert_eq!(job.target_base_oid, test_oid('e'));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(state.queue.pending_job_ids, vec!["job-1"]);
        assert_eq!(state.queue.active_job_id, None);
    }

    #[test]
    fn test_missing_descendant_does_not_block_plan_creation() {
        let (_, intent) = snapshot_and_intent();
        // The child branches vanished after the intent was built. Planning
        // still succeeds: only the root target's branch must exist, and
        // the executor fails the missing branches' own jobs when (if) they
        // come up.
        let snapshot = SnapshotBuilder::new()
            .commit('a', None)
            .commit('b', Some('a'))
            .commit('e', Some('a'))
            .branch("main", 'e')
            .branch("parent", 'b')
            .build();
        let mut ids = JobIdGenerator::new();
        let state = create_rebase_plan(&snapshot, &intent, &mut ids, 1_000).unwrap();
        assert_eq!(state.jobs_by_id.len(), 1);
        assert_eq!(state.jobs_by_id["job-1"].branch, "parent");

        // A missing root target is still an error.
        let no_root = SnapshotBuilder::new()
            .commit('a', None)
            .commit('e', Some('a'))
            .branch("main", 'e')
            .build();
        let result = create_rebase_plan(&no_root, &intent, &mut ids, 1_000);
        assert!(matches!(result, Err(PlanError::BranchNotFound { .. })));
    }

    #[test]
    fn test_empty_intent_is_rejected() {
        let (snapshot, intent) = snapshot_and_intent();
        let empty = RebaseIntent {
            targets: Vec::new(),
            ..intent
        };
        let mut ids = JobIdGenerator::new();
        let result = create_rebase_plan(&snapshot, &empty, &mut ids, 1_000);
        assert!(matches!(result, Err(PlanError::EmptyIntent)));
    }

    #[test]
    fn test_next_job_is_exclusive() {
        let (snapshot, intent) = snapshot_and_intent();
        let mut ids = JobIdGenerator::new();
        let mut state = create_rebase_plan(&snapshot, &intent, &mut ids, 1_000).unwrap();

        let job = state.next_job(1_001).unwrap();
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(state.queue.active_job_id.as_deref(), Some("job-1"));

        // No other job may start while one is active.
        assert_eq!(state.next_job(1_002), None);
    }

    #[test]
    fn test_conflict_then_complete() {
        let (snapshot, intent) = snapshot_and_intent();
        let mut ids = JobIdGenerator::new();
        let mut state = create_rebase_plan(&snapshot, &intent, &mut ids, 1_000).unwrap();
        let job = state.next_job(1_001).unwrap();

        state
            .record_conflict(&job.id, vec!["f.txt".into()], 1_002)
            .unwrap();
        assert_eq!(state.session.status, SessionStatus::AwaitingUser);
        let paused = state.active_job().unwrap();
        assert_eq!(paused.status, JobStatus::AwaitingUser);
        assert_eq!(
            paused.conflict.as_ref().unwrap().conflicted_paths,
            vec![std::path::PathBuf::from("f.txt")]
        );

        // Completion is legal directly from awaiting-user.
        let rewrites = vec![CommitRewrite {
            branch: "parent".to_string(),
            old_oid: test_oid('b'),
            new_oid: test_oid('f'),
        }];
        state.complete_job(&job.id, rewrites.clone(), 1_003).unwrap();
        assert_eq!(state.session.status, SessionStatus::Running);
        assert_eq!(state.queue.active_job_id, None);
        assert_eq!(state.session.commit_map, rewrites);
        assert_eq!(state.jobs_by_id[&job.id].status, JobStatus::Completed);
    }

    #[test]
    fn test_commit_map_deduplicates() {
        let (snapshot, intent) = snapshot_and_intent();
        let mut ids = JobIdGenerator::new();
        let mut state = create_rebase_plan(&snapshot, &intent, &mut ids, 1_000).unwrap();
        let job = state.next_job(1_001).unwrap();

        let rewrite = CommitRewrite {
            branch: "parent".to_string(),
            old_oid: test_oid('b'),
            new_oid: test_oid('f'),
        };
        state
            .complete_job(&job.id, vec![rewrite.clone(), rewrite.clone()], 1_002)
            .unwrap();
        assert_eq!(state.session.commit_map, vec![rewrite]);
    }

    #[test]
    fn test_enqueue_descendants_in_order() {
        let (snapshot, intent) = snapshot_and_intent();
        let mut ids = JobIdGenerator::new();
        let mut state = create_rebase_plan(&snapshot, &intent, &mut ids, 1_000).unwrap();
        let job = state.next_job(1_001).unwrap();
        state.complete_job(&job.id, Vec::new(), 1_002).unwrap();

        let parent_node = intent.find_node("parent").unwrap();
        let enqueued = state
            .enqueue_descendants(parent_node, &test_oid('f'), &mut ids, 1_003)
            .unwrap();
        assert_eq!(enqueued, vec!["job-2", "job-3"]);
        assert_eq!(state.queue.pending_job_ids, vec!["job-2", "job-3"]);

        let child_1 = &state.jobs_by_id["job-2"];
        assert_eq!(child_1.branch, "child-1");
        // The child's original base is the parent's pre-rebase head; its
        // target is the parent's new head.
        assert_eq!(child_1.original_base_oid, test_oid('b'));
        assert_eq!(child_1.original_head_oid, test_oid('c'));
        assert_eq!(child_1.target_base_oid, test_oid('f'));

        // Siblings run in insertion order.
        let first = state.next_job(1_004).unwrap();
        assert_eq!(first.branch, "child-1");
        state.complete_job(&first.id, Vec::new(), 1_005).unwrap();
        let second = state.next_job(1_006).unwrap();
        assert_eq!(second.branch, "child-2");
    }

    #[test]
    fn test_enqueue_rejects_duplicate_branch() {
        let (snapshot, intent) = snapshot_and_intent();
        let mut ids = JobIdGenerator::new();
        let mut state = create_rebase_plan(&snapshot, &intent, &mut ids, 1_000).unwrap();
        let job = state.next_job(1_001).unwrap();
        state.complete_job(&job.id, Vec::new(), 1_002).unwrap();

        let parent_node = intent.find_node("parent").unwrap();
        state
            .enqueue_descendants(parent_node, &test_oid('f'), &mut ids, 1_003)
            .unwrap();
        let result = state.enqueue_descendants(parent_node, &test_oid('f'), &mut ids, 1_004);
        assert!(matches!(result, Err(PlanError::DuplicateBranch { .. })));
    }

    #[test]
    fn test_fail_job_clears_active() {
        let (snapshot, intent) = snapshot_and_intent();
        let mut ids = JobIdGenerator::new();
        let mut state = create_rebase_plan(&snapshot, &intent, &mut ids, 1_000).unwrap();
        let job = state.next_job(1_001).unwrap();

        state
            .fail_job(&job.id, "branch not found".to_string(), 1_002)
            .unwrap();
        assert_eq!(state.queue.active_job_id, None);
        let failed = &state.jobs_by_id[&job.id];
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("branch not found"));
    }

    #[test]
    fn test_illegal_transitions() {
        let (snapshot, intent) = snapshot_and_intent();
        let mut ids = JobIdGenerator::new();
        let mut state = create_rebase_plan(&snapshot, &intent, &mut ids, 1_000).unwrap();

        // Completing a job that was never started is illegal.
        let result = state.complete_job("job-1", Vec::new(), 1_001);
        assert!(matches!(
            result,
            Err(PlanError::IllegalTransition {
                status: JobStatus::Pending,
                ..
            })
        ));
        let result = state.record_conflict("nope", Vec::new(), 1_002);
        assert!(matches!(result, Err(PlanError::UnknownJob { .. })));
    }
}
