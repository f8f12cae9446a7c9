//! End-to-end tests for conflict suspension, continue/skip, aborting, and
//! crash recovery.

use std::path::PathBuf;

use cascade::core::context::get_stored_execution_path;
use cascade::core::intent::build_rebase_intent;
use cascade::core::rewrite::{
    abort_rebase, continue_rebase, execute_rebase_intent, rebase_status, skip_commit,
    ExecuteRebaseResult, JobStatus,
};
use cascade::core::session::get_session;
use cascade::core::validate::ValidationError;
use cascade::git::NonZeroOid;
use cascade::testing::{make_git, GitWrapper};
use cascade::util::now_ms;

/// Sets up a repository where replaying `feature` onto the new trunk head
/// conflicts on `f.txt`, and submits the intent. Returns the pre-rebase
/// feature head and the new trunk head.
fn submit_conflicting_rebase(git: &GitWrapper) -> eyre::Result<(NonZeroOid, NonZeroOid)> {
    git.init_repo()?;
    git.commit_file_with_contents("f", 1, "L1\nL2\nL3\n")?;
    git.run(&["checkout", "-b", "feature"])?;
    let feature_head = git.commit_file_with_contents("f", 2, "L1\nfeature\nL3\n")?;
    git.run(&["checkout", "main"])?;
    let main_head = git.commit_file_with_contents("f", 3, "L1\nmain\nL3\n")?;

    let repo = git.get_repo()?;
    let snapshot = repo.snapshot()?;
    let intent =
        build_rebase_intent(&snapshot, &feature_head, &main_head, now_ms())?.expect("intent");
    match execute_rebase_intent(&repo, &snapshot, &intent)? {
        ExecuteRebaseResult::Conflict { conflicted_paths } => {
            assert_eq!(conflicted_paths, vec![PathBuf::from("f.txt")]);
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
    Ok((feature_head, main_head))
}

#[test]
fn test_conflict_resolve_continue() -> eyre::Result<()> {
    let git = make_git()?;
    let (_feature_head, main_head) = submit_conflicting_rebase(&git)?;
    let repo = git.get_repo()?;

    // The session and execution context survive the suspension.
    assert!(get_session(&repo).is_some());
    let execution_path = get_stored_execution_path(&repo).expect("stored context");
    assert!(execution_path.exists());

    // Continuing before resolving anything is rejected.
    match continue_rebase(&repo)? {
        ExecuteRebaseResult::Invalid(ValidationError::UnresolvedConflicts { paths }) => {
            assert_eq!(paths, vec![PathBuf::from("f.txt")]);
        }
        other => panic!("expected unresolved-conflicts, got {other:?}"),
    }

    // Resolve the file in the execution tree and continue.
    std::fs::write(execution_path.join("f.txt"), "L1\nresolved\nL3\n")?;
    match continue_rebase(&repo)? {
        ExecuteRebaseResult::Completed { state, .. } => {
            assert_eq!(state.session.commit_map.len(), 1);
        }
        other => panic!("expected completion, got {other:?}"),
    }

    assert_eq!(git.resolve("feature^")?, main_head);
    let (contents, _stderr) = git.run(&["show", "feature:f.txt"])?;
    assert_eq!(contents, "L1\nresolved\nL3\n");

    // All state was cleared and the temporary tree released.
    assert_eq!(get_session(&repo), None);
    assert_eq!(get_stored_execution_path(&repo), None);
    assert!(!execution_path.exists());
    Ok(())
}

#[test]
fn test_skip_drops_the_conflicting_commit() -> eyre::Result<()> {
    let git = make_git()?;
    let (_feature_head, main_head) = submit_conflicting_rebase(&git)?;
    let repo = git.get_repo()?;

    let state = match skip_commit(&repo)? {
        ExecuteRebaseResult::Completed { state, .. } => state,
        other => panic!("expected completion, got {other:?}"),
    };

    // The branch's only commit was dropped: its head is now the target
    // base, and no rewrites were recorded.
    assert_eq!(git.resolve("feature")?, main_head);
    assert_eq!(state.session.commit_map, Vec::new());
    assert!(state
        .jobs_by_id
        .values()
        .any(|job| job.status == JobStatus::Skipped));
    assert_eq!(get_session(&repo), None);
    Ok(())
}

#[test]
fn test_descendant_deleted_mid_rebase_drops_only_its_subtree() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    git.commit_file_with_contents("f", 1, "L1\nL2\nL3\n")?;
    git.run(&["checkout", "-b", "feature"])?;
    let feature_head = git.commit_file_with_contents("f", 2, "L1\nfeature\nL3\n")?;
    git.run(&["checkout", "-b", "feature-2"])?;
    git.commit_file("stacked", 3)?;
    git.run(&["checkout", "main"])?;
    let main_head = git.commit_file_with_contents("f", 4, "L1\nmain\nL3\n")?;

    let repo = git.get_repo()?;
    let snapshot = repo.snapshot()?;
    let intent =
        build_rebase_intent(&snapshot, &feature_head, &main_head, now_ms())?.expect("intent");
    assert_eq!(intent.all_branches(), vec!["feature", "feature-2"]);
    match execute_rebase_intent(&repo, &snapshot, &intent)? {
        ExecuteRebaseResult::Conflict { .. } => {}
        other => panic!("expected a conflict, got {other:?}"),
    }

    // The stacked branch disappears while the rebase is suspended.
    git.run(&["branch", "-D", "feature-2"])?;

    let execution_path = get_stored_execution_path(&repo).expect("stored context");
    std::fs::write(execution_path.join("f.txt"), "L1\nresolved\nL3\n")?;
    let (state, warnings) = match continue_rebase(&repo)? {
        ExecuteRebaseResult::Completed { state, warnings } => (state, warnings),
        other => panic!("expected completion, got {other:?}"),
    };

    // The ancestor's rebase landed; only the vanished branch's subtree was
    // dropped, with a warning.
    assert_eq!(git.resolve("feature^")?, main_head);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("feature-2"), "warning: {}", warnings[0]);
    let failed: Vec<&str> = state
        .jobs_by_id
        .values()
        .filter(|job| job.status == JobStatus::Failed)
        .map(|job| job.branch.as_str())
        .collect();
    assert_eq!(failed, vec!["feature-2"]);
    assert_eq!(state.session.commit_map.len(), 1);
    assert_eq!(get_session(&repo), None);
    Ok(())
}

#[test]
fn test_abort_is_idempotent_without_a_session() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    let repo = git.get_repo()?;

    abort_rebase(&repo)?;
    let report = rebase_status(&repo)?;
    assert!(!report.is_rebasing);
    assert!(!report.has_session);

    // A second abort succeeds and changes nothing.
    abort_rebase(&repo)?;
    let report = rebase_status(&repo)?;
    assert!(!report.is_rebasing);
    assert!(!report.has_session);
    Ok(())
}

#[test]
fn test_crash_recovery_via_the_session_record() -> eyre::Result<()> {
    let git = make_git()?;
    let (feature_head, _main_head) = submit_conflicting_rebase(&git)?;

    // Simulate a process restart: everything in memory is gone, and the
    // engine is reconstructed from disk alone.
    let repo = git.get_repo()?;
    let report = rebase_status(&repo)?;
    assert!(report.has_session);
    assert!(report.is_rebasing);
    assert_eq!(report.conflicted_paths, vec![PathBuf::from("f.txt")]);
    let state = report.state.expect("stored state");
    assert!(state
        .jobs_by_id
        .values()
        .any(|job| job.status == JobStatus::AwaitingUser));

    let execution_path = get_stored_execution_path(&repo).expect("stored context");
    abort_rebase(&repo)?;

    // The branch head is back at its pre-rebase commit, and all session
    // state is gone, including the temporary worktree.
    assert_eq!(git.resolve("feature")?, feature_head);
    let report = rebase_status(&repo)?;
    assert!(!report.has_session);
    assert!(!report.is_rebasing);
    assert!(!execution_path.exists());

    // Continue after abort is a no-op: the session is gone.
    match continue_rebase(&repo)? {
        ExecuteRebaseResult::Invalid(ValidationError::SessionNotFound) => {}
        other => panic!("expected session-not-found, got {other:?}"),
    }
    Ok(())
}
