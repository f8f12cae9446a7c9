//! Driving a rebase plan against a Git working tree.
//!
//! The executor is the only component that talks to both the state machine
//! and the Git adapter. It acquires an execution context, runs jobs one at
//! a time, records rewrites, and persists the session after every
//! transition so that a crash at any point can be recovered from the
//! stored record alone.

use std::path::PathBuf;

use eyre::eyre;
use itertools::Itertools;
use tracing::{info, instrument, warn};

use crate::core::config::get_use_parallel_worktree;
use crate::core::conflicts::file_has_conflict_markers;
use crate::core::context::{self, ExecutionContext};
use crate::core::intent::RebaseIntent;
use crate::core::session::{
    self, AutoDetachedWorktree, StoredRebaseSession,
};
use crate::core::validate::{validate_rebase, ValidationError};
use crate::git::{
    NonZeroOid, RebaseProgress, Repo, RepoError, RepoSnapshot,
};
use crate::util::now_ms;

use super::plan::{
    create_rebase_plan, CommitRewrite, JobIdGenerator, PlanError, RebaseState, SessionStatus,
};

/// The deepest commit range the executor will enumerate for rewrite
/// pairing. Branches deeper than this still rebase; the rewrite map is
/// simply truncated.
pub const MAX_REPLAY_DEPTH: usize = 100;

/// The purpose recorded on execution contexts acquired for rebasing.
const REBASE_PURPOSE: &str = "rebase";

/// The result of driving (part of) a rebase plan.
#[derive(Debug)]
pub enum ExecuteRebaseResult {
    /// The queue drained; every job reached a terminal state.
    Completed {
        /// The final state, as persisted just before the session record
        /// was cleared.
        state: RebaseState,

        /// Non-fatal problems encountered during finalization.
        warnings: Vec<String>,
    },

    /// A job paused on conflicts. The session and execution context remain
    /// stored; resolve the files and continue, or abort.
    Conflict {
        /// The conflicted files, relative to the execution path.
        conflicted_paths: Vec<PathBuf>,
    },

    /// A precondition failed; nothing was executed (or, for a worktree
    /// conflict discovered mid-flight, execution stopped and the session
    /// was cleaned up).
    Invalid(ValidationError),
}

/// A snapshot of the engine's state for status displays.
#[derive(Debug)]
pub struct RebaseStatusReport {
    /// Whether a rebase is underway in the execution path.
    pub is_rebasing: bool,

    /// Whether a session record exists.
    pub has_session: bool,

    /// The stored state, if a session exists.
    pub state: Option<RebaseState>,

    /// The files currently conflicted in the execution path.
    pub conflicted_paths: Vec<PathBuf>,

    /// Step progress parsed from Git's rebase state, if mid-rebase.
    pub progress: Option<RebaseProgress>,
}

enum JobsOutcome {
    Completed { warnings: Vec<String> },
    Conflict { conflicted_paths: Vec<PathBuf> },
    WorktreeConflict { name: String, path: PathBuf },
}

enum ResumeMode {
    Continue,
    Skip,
}

/// Execute a freshly-built intent against the repository.
#[instrument(skip(snapshot, intent))]
pub fn execute_rebase_intent(
    repo: &Repo,
    snapshot: &RepoSnapshot,
    intent: &RebaseIntent,
) -> eyre::Result<ExecuteRebaseResult> {
    let now = now_ms();
    let mut ids = JobIdGenerator::new();
    let state = match create_rebase_plan(snapshot, intent, &mut ids, now) {
        Ok(state) => state,
        Err(PlanError::EmptyIntent) => {
            return Ok(ExecuteRebaseResult::Invalid(ValidationError::InvalidIntent))
        }
        Err(PlanError::BranchNotFound { name }) => {
            return Ok(ExecuteRebaseResult::Invalid(
                ValidationError::BranchNotFound { name },
            ))
        }
        Err(err) => return Err(err.into()),
    };

    let preparation = match validate_rebase(repo, intent)? {
        Ok(preparation) => preparation,
        Err(validation_error) => return Ok(ExecuteRebaseResult::Invalid(validation_error)),
    };

    let original_branch = repo.current_branch()?;

    let mut auto_detached_worktrees = Vec::new();
    for worktree in preparation.worktrees_to_detach {
        repo.in_worktree(&worktree.path).detach_head()?;
        auto_detached_worktrees.push(worktree);
    }

    let trunk_head_oid = state.session.initial_trunk_oid.clone();
    let mut session = StoredRebaseSession {
        intent: intent.clone(),
        state,
        original_branch,
        auto_detached_worktrees,
    };
    if let Err(err) = session::create_session(repo, &session) {
        restore_worktrees(repo, &session.auto_detached_worktrees, &mut Vec::new());
        return match err {
            session::SessionError::AlreadyExists { .. } => {
                Ok(ExecuteRebaseResult::Invalid(ValidationError::SessionExists))
            }
            other => Err(other.into()),
        };
    }

    let use_parallel_worktree = get_use_parallel_worktree(repo)?;
    let execution_context = match context::acquire(
        repo,
        REBASE_PURPOSE,
        &trunk_head_oid,
        use_parallel_worktree,
    ) {
        Ok(execution_context) => execution_context,
        Err(err) => {
            restore_worktrees(repo, &session.auto_detached_worktrees, &mut Vec::new());
            session::clear_session(repo);
            return Err(err.into());
        }
    };

    let outcome = execute_jobs(repo, &execution_context, &mut session)?;
    conclude(repo, &execution_context, session, outcome)
}

/// Continue a rebase suspended on conflicts. Files whose conflict markers
/// have been removed are staged automatically; at least one must have been
/// touched.
#[instrument]
pub fn continue_rebase(repo: &Repo) -> eyre::Result<ExecuteRebaseResult> {
    let Some(session) = session::get_session(repo) else {
        return Ok(ExecuteRebaseResult::Invalid(ValidationError::SessionNotFound));
    };
    let execution_context = acquire_for_resume(repo);
    let execution_repo = repo.in_worktree(&execution_context.execution_path);

    let status = execution_repo.working_tree_status()?;
    if !status.is_rebasing {
        return Ok(ExecuteRebaseResult::Invalid(
            ValidationError::RebaseNotInProgress,
        ));
    }

    let mut staged_count = 0;
    let mut unresolved = Vec::new();
    for path in &status.conflicted {
        let absolute = execution_context.execution_path.join(path);
        if file_has_conflict_markers(&absolute) {
            unresolved.push(path.clone());
        } else {
            execution_repo.add(&[path.as_path()])?;
            staged_count += 1;
        }
    }
    if !status.conflicted.is_empty() && staged_count == 0 {
        return Ok(ExecuteRebaseResult::Invalid(
            ValidationError::UnresolvedConflicts { paths: unresolved },
        ));
    }

    resume_with(repo, execution_context, session, ResumeMode::Continue)
}

/// Skip the commit currently paused on conflicts and continue draining the
/// queue.
#[instrument]
pub fn skip_commit(repo: &Repo) -> eyre::Result<ExecuteRebaseResult> {
    let Some(session) = session::get_session(repo) else {
        return Ok(ExecuteRebaseResult::Invalid(ValidationError::SessionNotFound));
    };
    let execution_context = acquire_for_resume(repo);
    let execution_repo = repo.in_worktree(&execution_context.execution_path);
    if !execution_repo.working_tree_status()?.is_rebasing {
        return Ok(ExecuteRebaseResult::Invalid(
            ValidationError::RebaseNotInProgress,
        ));
    }
    resume_with(repo, execution_context, session, ResumeMode::Skip)
}

/// Abort the rebase and clear all persisted state. Always the escape
/// hatch: aborting when there is nothing to abort succeeds silently.
#[instrument]
pub fn abort_rebase(repo: &Repo) -> eyre::Result<()> {
    let session = session::get_session(repo);
    let stored_context = context::get_stored_context(repo);
    if session.is_none() && stored_context.is_none() {
        return Ok(());
    }

    let execution_context = stored_context.unwrap_or_else(|| ExecutionContext {
        execution_path: repo.get_working_copy_path().to_path_buf(),
        is_temporary: false,
        acquired_at_ms: now_ms(),
        purpose: REBASE_PURPOSE.to_string(),
    });
    let execution_repo = repo.in_worktree(&execution_context.execution_path);
    if execution_context.execution_path.exists() && execution_repo.is_rebase_underway()? {
        let outcome = execution_repo.rebase_abort()?;
        if !outcome.success {
            return Err(eyre!(
                "git rebase --abort failed: {}",
                outcome.error.unwrap_or_default()
            ));
        }
    }

    context::clear_stored_context(repo);
    if let Err(err) = context::release(repo, &execution_context) {
        warn!(?err, "could not release execution context during abort");
    }

    if let Some(mut session) = session {
        let mut warnings = Vec::new();
        restore_worktrees(repo, &session.auto_detached_worktrees, &mut warnings);
        for warning in warnings {
            warn!(%warning, "while aborting");
        }
        session.state.session.status = SessionStatus::Aborted;
        session::update_state(repo, &session.state);
        session::clear_session(repo);
    }
    Ok(())
}

/// Report the engine's current state for this repository.
#[instrument]
pub fn rebase_status(repo: &Repo) -> eyre::Result<RebaseStatusReport> {
    let session = session::get_session(repo);
    let execution_path = context::get_stored_execution_path(repo)
        .filter(|path| path.exists())
        .unwrap_or_else(|| repo.get_working_copy_path().to_path_buf());
    let execution_repo = repo.in_worktree(&execution_path);
    let status = execution_repo.working_tree_status()?;
    let progress = execution_repo.get_rebase_progress()?;
    Ok(RebaseStatusReport {
        is_rebasing: status.is_rebasing,
        has_session: session.is_some(),
        state: session.map(|session| session.state),
        conflicted_paths: status.conflicted,
        progress,
    })
}

/// Continue/abort/skip always reuse the stored context from the conflict
/// suspension. If it is gone (crash, manual cleanup), fall back to the
/// primary tree rather than allocating a fresh worktree which could not
/// contain the suspended rebase anyway.
fn acquire_for_resume(repo: &Repo) -> ExecutionContext {
    if let Some(stored) = context::get_stored_context(repo) {
        if stored.execution_path.exists() {
            return stored;
        }
        warn!(
            path = ?stored.execution_path,
            "stored execution context no longer exists on disk"
        );
        context::clear_stored_context(repo);
    }
    ExecutionContext {
        execution_path: repo.get_working_copy_path().to_path_buf(),
        is_temporary: false,
        acquired_at_ms: now_ms(),
        purpose: REBASE_PURPOSE.to_string(),
    }
}

fn resume_with(
    repo: &Repo,
    execution_context: ExecutionContext,
    mut session: StoredRebaseSession,
    mode: ResumeMode,
) -> eyre::Result<ExecuteRebaseResult> {
    let execution_repo = repo.in_worktree(&execution_context.execution_path);
    let outcome = match mode {
        ResumeMode::Continue => execution_repo.rebase_continue()?,
        ResumeMode::Skip => execution_repo.rebase_skip()?,
    };
    let now = now_ms();

    if !outcome.success {
        if !outcome.conflicts.is_empty() {
            if let Some(active_id) = session.state.queue.active_job_id.clone() {
                session
                    .state
                    .record_conflict(&active_id, outcome.conflicts.clone(), now)?;
            }
            session::update_state(repo, &session.state);
            context::store_context(repo, &execution_context)?;
            return Ok(ExecuteRebaseResult::Conflict {
                conflicted_paths: outcome.conflicts,
            });
        }
        return Err(eyre!(
            "could not resume rebase: {}",
            outcome.error.unwrap_or_default()
        ));
    }

    // The suspended job ran to the end of its commit range.
    let mut ids = JobIdGenerator::resuming(&session.state);
    if let Some(active_id) = session.state.queue.active_job_id.clone() {
        let job = session
            .state
            .jobs_by_id
            .get(&active_id)
            .cloned()
            .ok_or_else(|| eyre!("active job {active_id:?} not found in session"))?;
        let new_head_oid = execution_repo
            .resolve_ref(&job.branch)?
            .ok_or_else(|| eyre!("branch {:?} vanished during rebase", job.branch))?;
        let old_range = execution_repo.commit_range(
            &job.original_base_oid,
            &job.original_head_oid,
            MAX_REPLAY_DEPTH,
        )?;
        let new_range =
            execution_repo.commit_range(&job.target_base_oid, &new_head_oid, MAX_REPLAY_DEPTH)?;
        let rewrites = pair_rewrites(&job.branch, &old_range, &new_range);
        if rewrites.is_empty() {
            info!(branch = %job.branch, "every commit dropped during rebase; branch is now empty");
            session.state.mark_skipped(&active_id, now)?;
        } else {
            session.state.complete_job(&active_id, rewrites, now)?;
        }
        enqueue_children(&mut session, &job.branch, &new_head_oid, &mut ids, now)?;
        session::update_state(repo, &session.state);
    }

    let outcome = execute_jobs(repo, &execution_context, &mut session)?;
    conclude(repo, &execution_context, session, outcome)
}

fn execute_jobs(
    repo: &Repo,
    execution_context: &ExecutionContext,
    session: &mut StoredRebaseSession,
) -> eyre::Result<JobsOutcome> {
    let execution_repo = repo.in_worktree(&execution_context.execution_path);
    let mut ids = JobIdGenerator::resuming(&session.state);
    let mut warnings = Vec::new();

    loop {
        let now = now_ms();
        let job = match session.state.next_job(now) {
            Some(job) => job,
            None => return Ok(JobsOutcome::Completed { warnings }),
        };
        session::update_state(repo, &session.state);

        // A branch with no owned commits has nothing to replay; it
        // completes immediately and its children cascade from its
        // unchanged head.
        if job.original_base_oid == job.original_head_oid {
            session.state.complete_job(&job.id, Vec::new(), now)?;
            enqueue_children(session, &job.branch, &job.original_head_oid, &mut ids, now)?;
            session::update_state(repo, &session.state);
            continue;
        }

        if execution_repo.resolve_ref(&job.branch)?.is_none() {
            session
                .state
                .fail_job(&job.id, "branch not found".to_string(), now)?;
            warnings.push(format!(
                "branch {:?} no longer exists; its stack was skipped",
                job.branch
            ));
            session::update_state(repo, &session.state);
            continue;
        }

        let old_range = execution_repo.commit_range(
            &job.original_base_oid,
            &job.original_head_oid,
            MAX_REPLAY_DEPTH,
        )?;

        match execution_repo.checkout(&job.branch, false) {
            Ok(()) => {}
            Err(RepoError::WorktreeLock {
                ref_name: _,
                worktree_path,
            }) => {
                return Ok(JobsOutcome::WorktreeConflict {
                    name: job.branch.clone(),
                    path: worktree_path,
                });
            }
            Err(err) => return Err(err.into()),
        }

        let outcome = match execution_repo.rebase(
            &job.target_base_oid,
            &job.original_base_oid,
            &job.branch,
        ) {
            Ok(outcome) => outcome,
            Err(RepoError::WorktreeLock {
                ref_name: _,
                worktree_path,
            }) => {
                return Ok(JobsOutcome::WorktreeConflict {
                    name: job.branch.clone(),
                    path: worktree_path,
                });
            }
            Err(err) => return Err(err.into()),
        };

        if outcome.success {
            let new_head_oid = execution_repo
                .resolve_ref(&job.branch)?
                .ok_or_else(|| eyre!("branch {:?} vanished during rebase", job.branch))?;
            let new_range = execution_repo.commit_range(
                &job.target_base_oid,
                &new_head_oid,
                MAX_REPLAY_DEPTH,
            )?;
            let rewrites = pair_rewrites(&job.branch, &old_range, &new_range);
            if rewrites.is_empty() && !old_range.is_empty() {
                info!(
                    branch = %job.branch,
                    "every commit dropped during rebase; branch is now empty"
                );
            }
            session.state.complete_job(&job.id, rewrites, now)?;
            enqueue_children(session, &job.branch, &new_head_oid, &mut ids, now)?;
            session::update_state(repo, &session.state);
        } else if !outcome.conflicts.is_empty() {
            session
                .state
                .record_conflict(&job.id, outcome.conflicts.clone(), now)?;
            session::update_state(repo, &session.state);
            return Ok(JobsOutcome::Conflict {
                conflicted_paths: outcome.conflicts,
            });
        } else {
            return Err(eyre!(
                "git rebase failed for branch {:?}: {}",
                job.branch,
                outcome.error.unwrap_or_default()
            ));
        }
    }
}

fn enqueue_children(
    session: &mut StoredRebaseSession,
    parent_branch: &str,
    parent_new_head_oid: &NonZeroOid,
    ids: &mut JobIdGenerator,
    now_ms: u64,
) -> eyre::Result<()> {
    let Some(parent_node) = session.intent.find_node(parent_branch) else {
        return Ok(());
    };
    let parent_node = parent_node.clone();
    session
        .state
        .enqueue_descendants(&parent_node, parent_new_head_oid, ids, now_ms)?;
    Ok(())
}

/// Pair the original commits with the replayed ones by index, up to the
/// shorter length. Commits which became empty during replay are dropped by
/// Git, so the new range may be shorter than the old one.
fn pair_rewrites(
    branch: &str,
    old_range: &[NonZeroOid],
    new_range: &[NonZeroOid],
) -> Vec<CommitRewrite> {
    old_range
        .iter()
        .zip(new_range.iter())
        .map(|(old_oid, new_oid)| CommitRewrite {
            branch: branch.to_string(),
            old_oid: old_oid.clone(),
            new_oid: new_oid.clone(),
        })
        .collect_vec()
}

fn restore_worktrees(
    repo: &Repo,
    worktrees: &[AutoDetachedWorktree],
    warnings: &mut Vec<String>,
) {
    for worktree in worktrees {
        let worktree_repo = repo.in_worktree(&worktree.path);
        if let Err(err) = worktree_repo.checkout(&worktree.branch, false) {
            warnings.push(format!(
                "could not restore branch {:?} in worktree {:?}: {err}",
                worktree.branch, worktree.path
            ));
        }
    }
}

fn conclude(
    repo: &Repo,
    execution_context: &ExecutionContext,
    mut session: StoredRebaseSession,
    outcome: JobsOutcome,
) -> eyre::Result<ExecuteRebaseResult> {
    match outcome {
        JobsOutcome::Conflict { conflicted_paths } => {
            context::store_context(repo, execution_context)?;
            session::update_state(repo, &session.state);
            Ok(ExecuteRebaseResult::Conflict { conflicted_paths })
        }

        JobsOutcome::WorktreeConflict { name, path } => {
            // The validator should have caught this; another tool raced us.
            // Clean up so the user is not left with a half-configured
            // session.
            warn!(branch = %name, ?path, "target branch is locked by another worktree");
            context::clear_stored_context(repo);
            if let Err(err) = context::release(repo, execution_context) {
                warn!(?err, "could not release execution context");
            }
            restore_worktrees(repo, &session.auto_detached_worktrees, &mut Vec::new());
            session::clear_session(repo);
            Ok(ExecuteRebaseResult::Invalid(
                ValidationError::WorktreeConflict { name, path },
            ))
        }

        JobsOutcome::Completed { mut warnings } => {
            context::clear_stored_context(repo);
            if let Err(err) = context::release(repo, execution_context) {
                warnings.push(format!("could not release execution worktree: {err}"));
            }

            restore_worktrees(repo, &session.auto_detached_worktrees, &mut warnings);
            session::clear_auto_detached_worktrees(repo);

            if !execution_context.is_temporary {
                if let Some(original_branch) = &session.original_branch {
                    let execution_repo = repo.in_worktree(&execution_context.execution_path);
                    if let Err(err) = execution_repo.checkout(original_branch, false) {
                        warnings.push(format!(
                            "could not check out original branch {original_branch:?}: {err}"
                        ));
                    }
                }
            }

            session.state.session.status = SessionStatus::Completed;
            session::update_state(repo, &session.state);
            session::clear_session(repo);
            Ok(ExecuteRebaseResult::Completed {
                state: session.state,
                warnings,
            })
        }
    }
}
