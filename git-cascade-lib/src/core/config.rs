//! Accesses repo-specific configuration.

use eyre::Context;
use tracing::instrument;

use crate::git::Repo;

/// Get the configured trunk branch name, if one has been set explicitly
/// via `cascade.trunk`.
#[instrument]
pub fn get_trunk_override(repo: &Repo) -> eyre::Result<Option<String>> {
    let value = repo
        .get_config("cascade.trunk")
        .wrap_err("reading cascade.trunk")?;
    Ok(value.filter(|name| !name.is_empty()))
}

/// If `true` (the default), rebases execute in a disposable worktree so
/// the user's working tree is never disturbed. If `false`, rebases execute
/// in place when the active tree is clean.
#[instrument]
pub fn get_use_parallel_worktree(repo: &Repo) -> eyre::Result<bool> {
    let value = repo
        .get_config("cascade.parallelWorktree")
        .wrap_err("reading cascade.parallelWorktree")?;
    Ok(match value.as_deref() {
        Some("false") | Some("0") | Some("no") | Some("off") => false,
        Some(_) | None => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_git;

    #[test]
    fn test_config_defaults_and_overrides() -> eyre::Result<()> {
        let git = make_git()?;
        git.init_repo()?;
        let repo = git.get_repo()?;

        assert_eq!(get_trunk_override(&repo)?, None);
        assert!(get_use_parallel_worktree(&repo)?);

        repo.set_config("cascade.trunk", "develop")?;
        repo.set_config("cascade.parallelWorktree", "false")?;
        assert_eq!(get_trunk_override(&repo)?.as_deref(), Some("develop"));
        assert!(!get_use_parallel_worktree(&repo)?);

        repo.set_config("cascade.parallelWorktree", "true")?;
        assert!(get_use_parallel_worktree(&repo)?);
        Ok(())
    }
}
