//! End-to-end tests for the guarded branch operations.

use cascade::core::branches::{
    cleanup_merged_branches, delete_branch, rename_branch, BranchOpError,
};
use cascade::testing::make_git;

#[test]
fn test_cleanup_deletes_fully_merged_branches() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    // A branch left behind at an older trunk commit: fully merged.
    git.run(&["branch", "landed-feature"])?;
    git.run(&["checkout", "-b", "active-feature"])?;
    git.commit_file("test1", 1)?;
    git.run(&["checkout", "main"])?;
    git.commit_file("test2", 2)?;

    let repo = git.get_repo()?;
    let snapshot = repo.snapshot()?;
    let deleted = cleanup_merged_branches(&repo, &snapshot, None)?;
    assert_eq!(deleted, vec!["landed-feature".to_string()]);
    assert_eq!(repo.resolve_ref("landed-feature")?, None);
    // The unmerged branch survives.
    assert!(repo.resolve_ref("active-feature")?.is_some());
    assert!(repo.resolve_ref("main")?.is_some());
    Ok(())
}

#[test]
fn test_protected_trunk_names_are_refused() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    let repo = git.get_repo()?;
    let snapshot = repo.snapshot()?;

    let result = delete_branch(&repo, &snapshot, "main", None);
    assert!(matches!(
        result,
        Err(BranchOpError::ProtectedBranch { .. })
    ));
    assert!(repo.resolve_ref("main")?.is_some());

    // The guard is by name, case-insensitively, regardless of which
    // branch is currently the trunk.
    let result = rename_branch(&repo, "Master", "release");
    assert!(matches!(
        result,
        Err(BranchOpError::ProtectedBranch { .. })
    ));
    Ok(())
}

#[test]
fn test_delete_missing_branch() -> eyre::Result<()> {
    let git = make_git()?;
    git.init_repo()?;
    let repo = git.get_repo()?;
    let snapshot = repo.snapshot()?;

    let result = delete_branch(&repo, &snapshot, "no-such-branch", None);
    assert!(matches!(result, Err(BranchOpError::BranchNotFound { .. })));
    Ok(())
}
