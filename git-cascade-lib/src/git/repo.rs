//! Operations on the Git repository. This module exists for a few reasons:
//!
//! - To ensure that every Git invocation is classified: success, an
//!   expected "not found" case, or a typed error.
//! - To parse Git's output once, at the boundary, into the engine's types.
//! - To make it possible to audit all the Git operations carried out in the
//!   codebase.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use tracing::{instrument, warn};

use super::oid::{MaybeZeroOid, NonZeroOid, ParseOidError};
use super::run::{GitRunInfo, GitRunOpts, GitRunResult};
use super::snapshot::{
    BranchInfo, CommitDetails, RepoSnapshot, WorktreeInfo, SNAPSHOT_COMMIT_LIMIT,
};
use super::status::WorkingTreeStatus;

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum Error {
    #[error("no working copy is associated with the repository at {path:?}")]
    NoWorkingCopy { path: PathBuf },

    #[error("branch {ref_name:?} is checked out in the worktree at {worktree_path:?}")]
    WorktreeLock {
        ref_name: String,
        worktree_path: PathBuf,
    },

    #[error("could not find commit {oid}")]
    FindCommit { oid: NonZeroOid },

    #[error("could not parse Git output for `git {command}`: {message}")]
    ParseOutput { command: String, message: String },

    #[error("`git {command}` failed with exit code {exit_code}: {stderr}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error(transparent)]
    ParseOid(#[from] ParseOidError),

    #[error(transparent)]
    Other(#[from] eyre::Report),
}

/// Type synonym for `Result<T, git::repo::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The outcome of a rebase operation (or of continuing/aborting/skipping
/// one).
#[derive(Clone, Debug)]
pub struct RebaseOutcome {
    /// Whether the operation ran to completion.
    pub success: bool,

    /// The files left in a conflicted state, when the operation stopped for
    /// conflict resolution.
    pub conflicts: Vec<PathBuf>,

    /// Git's error output, when the operation failed for a reason other
    /// than conflicts.
    pub error: Option<String>,

    /// The commit being replayed when the operation stopped, if known.
    pub current_commit: Option<NonZeroOid>,
}

/// The outcome of a merge operation.
#[derive(Clone, Debug)]
pub struct MergeOutcome {
    /// Whether the merge ran to completion.
    pub success: bool,

    /// Whether the target was already up to date, so nothing was merged.
    pub already_up_to_date: bool,

    /// Git's error output, on failure.
    pub error: Option<String>,
}

/// Progress through an in-flight rebase, as recorded by Git.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebaseProgress {
    /// The 1-based number of the commit currently being replayed.
    pub current_step: usize,

    /// The total number of commits to replay.
    pub total_steps: usize,

    /// The branch being rebased, if recorded.
    pub branch: Option<String>,
}

/// The mode to pass to `git reset`.
#[derive(Copy, Clone, Debug)]
pub enum ResetMode {
    /// Move `HEAD` only.
    Soft,

    /// Move `HEAD` and reset the index.
    Mixed,

    /// Move `HEAD` and reset the index and working copy.
    Hard,
}

impl ResetMode {
    fn as_flag(self) -> &'static str {
        match self {
            ResetMode::Soft => "--soft",
            ResetMode::Mixed => "--mixed",
            ResetMode::Hard => "--hard",
        }
    }
}

lazy_static! {
    // Git phrases worktree-lock failures a few different ways depending on
    // the operation; all of them carry the offending path in quotes.
    static ref WORKTREE_LOCK_RES: Vec<Regex> = vec![
        Regex::new(r"already used by worktree at '([^']+)'").unwrap(),
        Regex::new(r"checked out in worktree at '([^']+)'").unwrap(),
        Regex::new(r"is already checked out at '([^']+)'").unwrap(),
    ];
}

fn parse_worktree_lock(stderr: &str) -> Option<PathBuf> {
    WORKTREE_LOCK_RES
        .iter()
        .find_map(|re| re.captures(stderr))
        .map(|captures| PathBuf::from(&captures[1]))
}

// Record separator \x1e, field separator \x1f. The subject (`%s`) is used
// as the message so that each record stays on one logical line.
const COMMIT_LOG_FORMAT: &str = "--format=%H%x1f%P%x1f%an <%ae>%x1f%cn <%ce>%x1f%ct%x1f%s%x1e";

fn parse_commit_records(output: &str) -> Result<Vec<CommitDetails>> {
    let mut commits = Vec::new();
    for record in output.split('\x1e') {
        let record = record.trim_matches(['\n', '\r', ' ']);
        if record.is_empty() {
            continue;
        }
        let fields = record.split('\x1f').collect_vec();
        let (oid, parents, author, committer, time, message) = match fields.as_slice() {
            [oid, parents, author, committer, time, message] => {
                (*oid, *parents, *author, *committer, *time, *message)
            }
            _ => {
                return Err(Error::ParseOutput {
                    command: "log".to_string(),
                    message: format!("unexpected commit record: {record:?}"),
                })
            }
        };
        let parent_oid = match parents.split_whitespace().next() {
            Some(parent) => Some(parent.parse::<NonZeroOid>()?),
            None => None,
        };
        let time_secs: u64 = time.parse().map_err(|_| Error::ParseOutput {
            command: "log".to_string(),
            message: format!("unexpected committer timestamp: {time:?}"),
        })?;
        commits.push(CommitDetails {
            oid: oid.parse()?,
            parent_oid,
            message: message.to_string(),
            author: author.to_string(),
            committer: committer.to_string(),
            time_ms: time_secs.saturating_mul(1000),
        });
    }
    Ok(commits)
}

/// A handle to an on-disk Git repository, bound to one of its working
/// trees.
#[derive(Clone)]
pub struct Repo {
    working_copy_path: PathBuf,
    git_dir: PathBuf,
    run_info: GitRunInfo,
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<Repo path={:?}>", self.working_copy_path)
    }
}

impl Repo {
    /// Open the repository containing the given directory.
    #[instrument]
    pub fn from_dir(path: &Path, run_info: GitRunInfo) -> Result<Self> {
        let toplevel = run_info
            .run_silent(path, &["rev-parse", "--show-toplevel"], Default::default())
            .map_err(|_| Error::NoWorkingCopy {
                path: path.to_path_buf(),
            })?
            .stdout_trimmed();
        let common_dir = run_info
            .run_silent(path, &["rev-parse", "--git-common-dir"], Default::default())?
            .stdout_trimmed();
        let working_copy_path = std::fs::canonicalize(&toplevel)
            .map_err(|err| eyre::eyre!("canonicalizing {toplevel:?}: {err}"))?;
        // `--git-common-dir` may be relative to the directory the command
        // ran in.
        let git_dir = std::fs::canonicalize(path.join(&common_dir))
            .map_err(|err| eyre::eyre!("canonicalizing {common_dir:?}: {err}"))?;
        Ok(Repo {
            working_copy_path,
            git_dir,
            run_info,
        })
    }

    /// A view of the same repository bound to a different working tree,
    /// e.g. a linked worktree used as an execution context.
    pub fn in_worktree(&self, path: &Path) -> Repo {
        Repo {
            working_copy_path: path.to_path_buf(),
            git_dir: self.git_dir.clone(),
            run_info: self.run_info.clone(),
        }
    }

    /// The path to the bound working tree.
    pub fn get_working_copy_path(&self) -> &Path {
        &self.working_copy_path
    }

    /// The path to the repository's common Git directory, shared by all of
    /// its worktrees.
    pub fn get_git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// The `GitRunInfo` used for invocations against this repository.
    pub fn get_run_info(&self) -> &GitRunInfo {
        &self.run_info
    }

    fn run_lenient(&self, args: &[&str]) -> Result<GitRunResult> {
        self.run_lenient_with_opts(args, Default::default())
    }

    fn run_lenient_with_opts(&self, args: &[&str], opts: GitRunOpts) -> Result<GitRunResult> {
        let result = self.run_info.run_silent(
            &self.working_copy_path,
            args,
            GitRunOpts {
                treat_git_failure_as_error: false,
                ..opts
            },
        )?;
        Ok(result)
    }

    fn run(&self, args: &[&str]) -> Result<GitRunResult> {
        let result = self.run_lenient(args)?;
        if result.exit_code != 0 {
            return Err(Error::Failed {
                command: args.iter().join(" "),
                exit_code: result.exit_code,
                stderr: result.stderr_lossy(),
            });
        }
        Ok(result)
    }

    /// Resolve a revision to a commit OID, or `None` if it doesn't name a
    /// commit.
    #[instrument]
    pub fn resolve_ref(&self, reference: &str) -> Result<Option<NonZeroOid>> {
        let target = format!("{reference}^{{commit}}");
        let result = self.run_lenient(&["rev-parse", "--verify", "--quiet", &target])?;
        if result.exit_code != 0 {
            return Ok(None);
        }
        Ok(Some(result.stdout_trimmed().parse()?))
    }

    /// Whether the given OID names a commit present in the repository.
    pub fn commit_exists(&self, oid: &NonZeroOid) -> Result<bool> {
        Ok(self.resolve_ref(oid.as_str())?.is_some())
    }

    /// The short name of the branch `HEAD` points to, or `None` if `HEAD`
    /// is detached.
    #[instrument]
    pub fn current_branch(&self) -> Result<Option<String>> {
        let result = self.run_lenient(&["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        if result.exit_code != 0 {
            return Ok(None);
        }
        Ok(Some(result.stdout_trimmed()))
    }

    /// Read a single commit.
    pub fn read_commit(&self, oid: &NonZeroOid) -> Result<CommitDetails> {
        self.log_commits(oid.as_str(), 1)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::FindCommit { oid: oid.clone() })
    }

    /// Enumerate up to `depth` commits reachable from `reference` along
    /// first-parent links, newest first.
    #[instrument]
    pub fn log_commits(&self, reference: &str, depth: usize) -> Result<Vec<CommitDetails>> {
        let depth = depth.to_string();
        let result = self.run_lenient(&[
            "log",
            "--first-parent",
            "-n",
            &depth,
            COMMIT_LOG_FORMAT,
            reference,
        ])?;
        if result.exit_code != 0 {
            return Err(Error::FindCommit {
                oid: reference
                    .parse()
                    .map_err(|_| Error::ParseOutput {
                        command: "log".to_string(),
                        message: format!("revision not found: {reference:?}"),
                    })?,
            });
        }
        parse_commit_records(&result.stdout_trimmed())
    }

    /// Enumerate the commits in `base..head` along first-parent links,
    /// oldest first, capped at `limit` commits.
    #[instrument]
    pub fn commit_range(
        &self,
        base: &NonZeroOid,
        head: &NonZeroOid,
        limit: usize,
    ) -> Result<Vec<NonZeroOid>> {
        let max_count = format!("--max-count={limit}");
        let range = format!("{base}..{head}");
        let result = self.run(&["rev-list", "--first-parent", &max_count, &range])?;
        let mut oids = Vec::new();
        for line in result.stdout_trimmed().lines() {
            oids.push(line.trim().parse::<NonZeroOid>()?);
        }
        oids.reverse();
        Ok(oids)
    }

    /// Check out the given revision.
    #[instrument]
    pub fn checkout(&self, reference: &str, detach: bool) -> Result<()> {
        let mut args = vec!["checkout"];
        if detach {
            args.push("--detach");
        }
        args.push(reference);
        let result = self.run_lenient(&args)?;
        if result.exit_code != 0 {
            let stderr = result.stderr_lossy();
            if let Some(worktree_path) = parse_worktree_lock(&stderr) {
                return Err(Error::WorktreeLock {
                    ref_name: reference.to_string(),
                    worktree_path,
                });
            }
            return Err(Error::Failed {
                command: args.iter().join(" "),
                exit_code: result.exit_code,
                stderr,
            });
        }
        Ok(())
    }

    /// Detach `HEAD` at the current commit, leaving the working copy
    /// untouched.
    pub fn detach_head(&self) -> Result<()> {
        self.run(&["checkout", "--detach"])?;
        Ok(())
    }

    /// Create a branch, optionally at a given start point, optionally
    /// checking it out.
    #[instrument]
    pub fn create_branch(
        &self,
        name: &str,
        start_point: Option<&str>,
        checkout: bool,
    ) -> Result<()> {
        let mut args = if checkout {
            vec!["checkout", "-b", name]
        } else {
            vec!["branch", name]
        };
        if let Some(start_point) = start_point {
            args.push(start_point);
        }
        self.run(&args)?;
        Ok(())
    }

    /// Delete a local branch.
    pub fn delete_branch(&self, name: &str) -> Result<()> {
        self.run(&["branch", "-D", name])?;
        Ok(())
    }

    /// Delete a remote-tracking branch (the local `refs/remotes/` ref, not
    /// the branch on the remote).
    pub fn delete_remote_tracking_branch(&self, remote: &str, name: &str) -> Result<()> {
        let ref_name = format!("{remote}/{name}");
        self.run(&["branch", "-r", "-D", &ref_name])?;
        Ok(())
    }

    /// Rename a local branch.
    pub fn rename_branch(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.run(&["branch", "-m", old_name, new_name])?;
        Ok(())
    }

    /// Create a commit from the current index.
    pub fn commit(&self, message: &str, amend: bool) -> Result<()> {
        let mut args = vec!["commit", "-m", message];
        if amend {
            args.push("--amend");
        }
        self.run(&args)?;
        Ok(())
    }

    /// Stage the given paths.
    pub fn add(&self, paths: &[&Path]) -> Result<()> {
        let mut args = vec!["add".to_string(), "--".to_string()];
        args.extend(paths.iter().map(|path| path.to_string_lossy().into_owned()));
        let args = args.iter().map(String::as_str).collect_vec();
        self.run(&args)?;
        Ok(())
    }

    /// Reset `HEAD` to the given revision.
    pub fn reset(&self, mode: ResetMode, reference: &str) -> Result<()> {
        self.run(&["reset", mode.as_flag(), reference])?;
        Ok(())
    }

    /// The status of the bound working tree.
    #[instrument]
    pub fn working_tree_status(&self) -> Result<WorkingTreeStatus> {
        let result = self.run(&["status", "--porcelain=v2", "--branch"])?;
        let mut status = WorkingTreeStatus::parse(&result.stdout_trimmed());
        status.is_rebasing = self.is_rebase_underway()?;
        Ok(status)
    }

    fn rebase_state_dir(&self, name: &str) -> Result<Option<PathBuf>> {
        let git_path = format!("--git-path={name}");
        let result = self.run(&["rev-parse", &git_path])?;
        let path = self.working_copy_path.join(result.stdout_trimmed());
        Ok(path.is_dir().then_some(path))
    }

    /// Whether a rebase is underway in the bound working tree.
    pub fn is_rebase_underway(&self) -> Result<bool> {
        Ok(self.rebase_state_dir("rebase-merge")?.is_some()
            || self.rebase_state_dir("rebase-apply")?.is_some())
    }

    /// Progress through the in-flight rebase, if one is underway.
    #[instrument]
    pub fn get_rebase_progress(&self) -> Result<Option<RebaseProgress>> {
        let (state_dir, step_file, total_file) =
            if let Some(dir) = self.rebase_state_dir("rebase-merge")? {
                (dir, "msgnum", "end")
            } else if let Some(dir) = self.rebase_state_dir("rebase-apply")? {
                (dir, "next", "last")
            } else {
                return Ok(None);
            };
        let read_step = |name: &str| -> Option<usize> {
            std::fs::read_to_string(state_dir.join(name))
                .ok()?
                .trim()
                .parse()
                .ok()
        };
        let branch = std::fs::read_to_string(state_dir.join("head-name"))
            .ok()
            .map(|contents| {
                contents
                    .trim()
                    .strip_prefix("refs/heads/")
                    .unwrap_or(contents.trim())
                    .to_string()
            });
        match (read_step(step_file), read_step(total_file)) {
            (Some(current_step), Some(total_steps)) => Ok(Some(RebaseProgress {
                current_step,
                total_steps,
                branch,
            })),
            _ => Ok(None),
        }
    }

    fn classify_rebase_result(&self, args: &[&str]) -> Result<RebaseOutcome> {
        let result = self.run_lenient(args)?;
        if result.exit_code == 0 {
            return Ok(RebaseOutcome {
                success: true,
                conflicts: Vec::new(),
                error: None,
                current_commit: None,
            });
        }

        let stderr = result.stderr_lossy();
        if let Some(worktree_path) = parse_worktree_lock(&stderr) {
            return Err(Error::WorktreeLock {
                ref_name: args.iter().join(" "),
                worktree_path,
            });
        }

        let status = self.working_tree_status()?;
        if status.is_rebasing && !status.conflicted.is_empty() {
            let current_commit = self
                .run_lenient(&["rev-parse", "--verify", "--quiet", "REBASE_HEAD"])?
                .stdout_trimmed()
                .parse::<NonZeroOid>()
                .ok();
            return Ok(RebaseOutcome {
                success: false,
                conflicts: status.conflicted,
                error: None,
                current_commit,
            });
        }

        Ok(RebaseOutcome {
            success: false,
            conflicts: Vec::new(),
            error: Some(stderr),
            current_commit: None,
        })
    }

    /// Replay the commits in `from..branch` onto `onto`, moving `branch` to
    /// the result.
    #[instrument]
    pub fn rebase(
        &self,
        onto: &NonZeroOid,
        from: &NonZeroOid,
        branch: &str,
    ) -> Result<RebaseOutcome> {
        self.classify_rebase_result(&[
            "rebase",
            "--onto",
            onto.as_str(),
            from.as_str(),
            branch,
        ])
    }

    /// Continue an in-flight rebase after conflicts have been staged.
    pub fn rebase_continue(&self) -> Result<RebaseOutcome> {
        self.classify_rebase_result(&["rebase", "--continue"])
    }

    /// Abort an in-flight rebase, restoring the branch being rebased.
    pub fn rebase_abort(&self) -> Result<RebaseOutcome> {
        self.classify_rebase_result(&["rebase", "--abort"])
    }

    /// Skip the commit currently being replayed and continue the rebase.
    pub fn rebase_skip(&self) -> Result<RebaseOutcome> {
        self.classify_rebase_result(&["rebase", "--skip"])
    }

    /// Merge the given revision into the current branch.
    #[instrument]
    pub fn merge(&self, reference: &str, ff_only: bool) -> Result<MergeOutcome> {
        let mut args = vec!["merge"];
        if ff_only {
            args.push("--ff-only");
        }
        args.push(reference);
        let result = self.run_lenient(&args)?;
        let stdout = result.stdout_trimmed();
        Ok(MergeOutcome {
            success: result.exit_code == 0,
            already_up_to_date: stdout.contains("Already up to date"),
            error: (result.exit_code != 0).then(|| result.stderr_lossy()),
        })
    }

    /// Fetch from the given remote.
    pub fn fetch(&self, remote: &str) -> Result<()> {
        self.run(&["fetch", remote])?;
        Ok(())
    }

    /// The merge-base of the two commits, or `None` if they share no
    /// history.
    #[instrument]
    pub fn find_merge_base(
        &self,
        lhs: &NonZeroOid,
        rhs: &NonZeroOid,
    ) -> Result<Option<NonZeroOid>> {
        let result = self.run_lenient(&["merge-base", lhs.as_str(), rhs.as_str()])?;
        match result.exit_code {
            0 => Ok(Some(result.stdout_trimmed().parse()?)),
            1 => Ok(None),
            exit_code => Err(Error::Failed {
                command: "merge-base".to_string(),
                exit_code,
                stderr: result.stderr_lossy(),
            }),
        }
    }

    /// Create a new worktree at `path` with a detached `HEAD` at `oid`.
    /// Worktree setup can run arbitrary filters and hooks, so it is given a
    /// bounded timeout.
    #[instrument]
    pub fn worktree_add_detached(
        &self,
        path: &Path,
        oid: &NonZeroOid,
        timeout: Duration,
    ) -> Result<()> {
        let path = path.to_string_lossy().into_owned();
        let result = self.run_lenient_with_opts(
            &["worktree", "add", "--detach", &path, oid.as_str()],
            GitRunOpts {
                timeout: Some(timeout),
                ..Default::default()
            },
        )?;
        if result.exit_code != 0 {
            return Err(Error::Failed {
                command: format!("worktree add --detach {path}"),
                exit_code: result.exit_code,
                stderr: result.stderr_lossy(),
            });
        }
        Ok(())
    }

    /// Remove the worktree at `path`. A worktree which is already gone is
    /// not an error; its administrative entry is pruned instead.
    #[instrument]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            let _ = self.run_lenient(&["worktree", "prune"])?;
            return Ok(());
        }
        let path_arg = path.to_string_lossy().into_owned();
        let result = self.run_lenient(&["worktree", "remove", "--force", &path_arg])?;
        if result.exit_code != 0 {
            let stderr = result.stderr_lossy();
            if stderr.contains("is not a working tree") {
                let _ = self.run_lenient(&["worktree", "prune"])?;
                return Ok(());
            }
            return Err(Error::Failed {
                command: format!("worktree remove --force {path_arg}"),
                exit_code: result.exit_code,
                stderr,
            });
        }
        Ok(())
    }

    /// List the repository's worktrees. The dirty check runs `git status`
    /// in each worktree, which can be slow; pass `skip_dirty_check` when
    /// the dirty flags are not needed.
    #[instrument]
    pub fn list_worktrees(&self, skip_dirty_check: bool) -> Result<Vec<WorktreeInfo>> {
        let result = self.run(&["worktree", "list", "--porcelain"])?;
        let stdout = result.stdout_trimmed();

        let mut worktrees = Vec::new();
        let mut is_first = true;
        for group in stdout.split("\n\n") {
            let mut path: Option<PathBuf> = None;
            let mut branch: Option<String> = None;
            let mut head_oid: Option<NonZeroOid> = None;
            let mut is_bare = false;
            let mut is_locked = false;
            for line in group.lines() {
                if let Some(worktree_path) = line.strip_prefix("worktree ") {
                    path = Some(PathBuf::from(worktree_path));
                } else if let Some(head) = line.strip_prefix("HEAD ") {
                    head_oid = MaybeZeroOid::from_str(head.trim())
                        .ok()
                        .and_then(MaybeZeroOid::into_option);
                } else if let Some(branch_ref) = line.strip_prefix("branch ") {
                    branch = Some(
                        branch_ref
                            .trim()
                            .strip_prefix("refs/heads/")
                            .unwrap_or(branch_ref.trim())
                            .to_string(),
                    );
                } else if line == "bare" {
                    is_bare = true;
                } else if line == "locked" || line.starts_with("locked ") {
                    is_locked = true;
                }
            }
            let is_main = is_first;
            is_first = false;
            let path = match path {
                Some(path) => path,
                None => continue,
            };
            if is_bare {
                continue;
            }
            let is_dirty = if skip_dirty_check || !path.exists() {
                false
            } else {
                match self.in_worktree(&path).working_tree_status() {
                    Ok(status) => !status.is_clean(),
                    Err(err) => {
                        warn!(?path, ?err, "could not read worktree status");
                        false
                    }
                }
            };
            worktrees.push(WorktreeInfo {
                path,
                branch,
                head_oid,
                is_dirty,
                is_main,
                is_locked,
            });
        }
        Ok(worktrees)
    }

    /// Read a single-valued config key.
    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let result = self.run_lenient(&["config", "--get", key])?;
        if result.exit_code != 0 {
            return Ok(None);
        }
        Ok(Some(result.stdout_trimmed()))
    }

    /// Set a config key in the repository's local configuration.
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.run(&["config", key, value])?;
        Ok(())
    }

    /// Build an immutable snapshot of the repository's branches, commits,
    /// and worktrees.
    #[instrument]
    pub fn snapshot(&self) -> Result<RepoSnapshot> {
        let trunk_override = self.get_config("cascade.trunk")?;

        let mut branches = Vec::new();
        let refs_result = self.run(&[
            "for-each-ref",
            "--format=%(objectname) %(refname)",
            "refs/heads",
            "refs/remotes",
        ])?;
        for line in refs_result.stdout_trimmed().lines() {
            let (oid, reference_name) = match line.split_once(' ') {
                Some(parts) => parts,
                None => continue,
            };
            if reference_name.ends_with("/HEAD") {
                // Symbolic refs like `refs/remotes/origin/HEAD` are not
                // branches.
                continue;
            }
            let (short_name, is_remote) =
                if let Some(short) = reference_name.strip_prefix("refs/heads/") {
                    (short.to_string(), false)
                } else if let Some(short) = reference_name.strip_prefix("refs/remotes/") {
                    (short.to_string(), true)
                } else {
                    continue;
                };
            let is_trunk = !is_remote && trunk_override.as_deref() == Some(short_name.as_str());
            branches.push(BranchInfo {
                reference_name: reference_name.to_string(),
                short_name,
                head_oid: oid.parse()?,
                is_trunk,
                is_remote,
            });
        }

        let limit = SNAPSHOT_COMMIT_LIMIT.to_string();
        let log_result = self.run_lenient(&[
            "log",
            "--all",
            "--first-parent",
            "-n",
            &limit,
            COMMIT_LOG_FORMAT,
        ])?;
        let commits = if log_result.exit_code == 0 {
            parse_commit_records(&log_result.stdout_trimmed())?
                .into_iter()
                .map(|commit| (commit.oid.clone(), commit))
                .collect()
        } else {
            // A repository with no commits yet.
            Default::default()
        };

        let worktrees = self.list_worktrees(false)?;

        Ok(RepoSnapshot {
            commits,
            branches,
            worktrees,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::make_git;

    #[test]
    fn test_parse_worktree_lock_messages() {
        assert_eq!(
            parse_worktree_lock("fatal: 'feature' is already used by worktree at '/tmp/wt'"),
            Some(PathBuf::from("/tmp/wt"))
        );
        assert_eq!(
            parse_worktree_lock("error: branch is checked out in worktree at '/tmp/other'"),
            Some(PathBuf::from("/tmp/other"))
        );
        assert_eq!(
            parse_worktree_lock("fatal: 'feature' is already checked out at '/tmp/main'"),
            Some(PathBuf::from("/tmp/main"))
        );
        assert_eq!(parse_worktree_lock("fatal: some other failure"), None);
    }

    #[test]
    fn test_adapter_round_trip() -> eyre::Result<()> {
        let git = make_git()?;
        git.init_repo()?;
        let repo = git.get_repo()?;

        let head = repo.resolve_ref("HEAD")?.unwrap();
        let commit = repo.read_commit(&head)?;
        assert_eq!(commit.message, "create initial.txt");
        assert_eq!(commit.parent_oid, None);
        assert_eq!(commit.author, "Testy McTestface <test@example.com>");

        assert_eq!(repo.current_branch()?.as_deref(), Some("main"));
        assert!(repo.commit_exists(&head)?);
        assert_eq!(repo.resolve_ref("no-such-ref")?, None);

        repo.create_branch("scratch", None, false)?;
        assert_eq!(repo.resolve_ref("scratch")?, Some(head.clone()));
        repo.rename_branch("scratch", "renamed")?;
        assert_eq!(repo.resolve_ref("scratch")?, None);
        repo.delete_branch("renamed")?;
        assert_eq!(repo.resolve_ref("renamed")?, None);

        let second = git.commit_file("second", 1)?;
        assert_eq!(repo.find_merge_base(&head, &second)?, Some(head.clone()));
        assert_eq!(repo.commit_range(&head, &second, 100)?, vec![second.clone()]);
        let log = repo.log_commits("HEAD", 10)?;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].oid, second);
        assert_eq!(log[0].parent_oid, Some(head.clone()));

        assert_eq!(repo.get_config("cascade.trunk")?, None);
        repo.set_config("cascade.trunk", "main")?;
        assert_eq!(repo.get_config("cascade.trunk")?.as_deref(), Some("main"));
        let snapshot = repo.snapshot()?;
        assert!(snapshot
            .find_local_branch("main")
            .is_some_and(|branch| branch.is_trunk));

        git.write_file("extra.txt", "extra\n")?;
        repo.add(&[Path::new("extra.txt")])?;
        repo.commit("add extra", false)?;
        let with_extra = repo.resolve_ref("HEAD")?.unwrap();
        assert_ne!(with_extra, second);
        repo.reset(ResetMode::Hard, second.as_str())?;
        assert_eq!(repo.resolve_ref("HEAD")?, Some(second.clone()));

        // Merging a descendant fast-forwards the current branch.
        repo.create_branch("ahead", None, true)?;
        git.commit_file("ahead-file", 2)?;
        let ahead = repo.resolve_ref("ahead")?.unwrap();
        repo.checkout("main", false)?;
        let merge = repo.merge("ahead", true)?;
        assert!(merge.success);
        assert_eq!(repo.resolve_ref("main")?, Some(ahead));

        let worktrees = repo.list_worktrees(true)?;
        assert_eq!(worktrees.len(), 1);
        assert!(worktrees[0].is_main);
        assert_eq!(worktrees[0].branch.as_deref(), Some("main"));
        Ok(())
    }
}
