//! Finding a valid base for a pull request whose ancestors have merged, and
//! the forge operations the engine is allowed to invoke.

use std::collections::HashSet;

use thiserror::Error;
use tracing::instrument;

/// The lifecycle state of a pull request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PullRequestState {
    /// Open for review.
    Open,

    /// Closed without merging.
    Closed,

    /// Merged into its base.
    Merged,
}

/// A pull request, as far as the engine cares about one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PullRequest {
    /// The branch the pull request proposes to merge.
    pub head_branch: String,

    /// The branch the pull request targets.
    pub base_branch: String,

    /// The pull request's state.
    pub state: PullRequestState,
}

/// The forge operations the engine may invoke. Everything else about the
/// forge is somebody else's problem.
pub trait Forge {
    /// Close the pull request whose head is the given branch.
    fn close_pull_request(&self, branch: &str) -> eyre::Result<()>;

    /// Delete the given branch on the remote.
    fn delete_remote_branch(&self, remote: &str, branch: &str) -> eyre::Result<()>;
}

#[allow(missing_docs)]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrBaseError {
    #[error("cannot determine a base for {branch:?}: every ancestor has been merged")]
    CannotDetermineBase { branch: String },
}

/// Find a valid base branch for a pull request.
///
/// If `target_branch` has not been merged, it is returned unchanged.
/// Otherwise the chain of pull requests is walked upwards: the pull request
/// whose head is the current target supplies the next target, until an
/// unmerged branch is found. If the chain runs out, the trunk fallback is
/// used. The walk is bounded by the number of pull requests, so a cyclic
/// chain cannot loop forever.
#[instrument]
pub fn resolve_pr_base(
    head_branch: &str,
    target_branch: &str,
    pull_requests: &[PullRequest],
    merged_branches: &HashSet<String>,
    trunk_fallback: Option<&str>,
) -> Result<String, PrBaseError> {
    let mut target = target_branch.to_string();
    let max_hops = pull_requests.len() + 1;
    for _ in 0..max_hops {
        if !merged_branches.contains(&target) {
            return Ok(target);
        }
        match pull_requests
            .iter()
            .find(|pull_request| pull_request.head_branch == target)
        {
            Some(pull_request) => target = pull_request.base_branch.clone(),
            None => break,
        }
    }
    trunk_fallback
        .map(String::from)
        .ok_or_else(|| PrBaseError::CannotDetermineBase {
            branch: head_branch.to_string(),
        })
}
