//! Testing utilities.
//!
//! This is inside `src` rather than `tests` since we use this code in some
//! unit tests.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::ops::Deref;
use std::path::PathBuf;
use std::process::Command;

use eyre::{eyre, Context};
use tempfile::TempDir;
use tracing::instrument;

use crate::git::{GitRunInfo, NonZeroOid, Repo};
use crate::util::get_from_path;

const DUMMY_NAME: &str = "Testy McTestface";
const DUMMY_EMAIL: &str = "test@example.com";

// An arbitrary fixed base timestamp, so that commit hashes are
// deterministic; per-commit time offsets keep distinct commits distinct.
const DUMMY_EPOCH_SECS: i64 = 1_650_000_000;

/// Wrapper around the Git executable, for testing.
#[derive(Clone, Debug)]
pub struct Git {
    /// The path to the repository on disk. The directory itself must
    /// exist, although it might not have a `.git` folder in it. (Use
    /// `Git::init_repo` to initialize it.)
    pub repo_path: PathBuf,

    /// The path to the Git executable on disk.
    pub path_to_git: PathBuf,
}

/// Options for `Git::run_with_options`.
#[derive(Debug, Default)]
pub struct GitRunOptions {
    /// The timestamp of the command. Mostly useful for `git commit`. This
    /// should be a number like 0, 1, 2, 3...
    pub time: isize,

    /// The exit code that `Git` should return.
    pub expected_exit_code: i32,

    /// The input to write to the child process's stdin.
    pub input: Option<String>,

    /// Additional environment variables to start the process with.
    pub env: HashMap<String, String>,
}

impl Git {
    /// Get the environment variables needed to run git in the test
    /// environment.
    pub fn get_base_env(&self, time: isize) -> Vec<(OsString, OsString)> {
        // Required for determinism, as these values will be baked into the
        // commit hash.
        let date: OsString =
            format!("{} +0000", DUMMY_EPOCH_SECS + i64::try_from(time).unwrap_or(0) * 100).into();

        // ":" is understood by `git` to skip editing.
        let git_editor = OsString::from(":");

        // Isolate the test repository from the user's configuration.
        let home = self
            .repo_path
            .parent()
            .map(|parent| parent.as_os_str().to_owned())
            .unwrap_or_default();

        let envs = vec![
            ("GIT_CONFIG_NOSYSTEM", OsString::from("1")),
            ("HOME", home),
            ("GIT_AUTHOR_NAME", OsString::from(DUMMY_NAME)),
            ("GIT_AUTHOR_EMAIL", OsString::from(DUMMY_EMAIL)),
            ("GIT_COMMITTER_NAME", OsString::from(DUMMY_NAME)),
            ("GIT_COMMITTER_EMAIL", OsString::from(DUMMY_EMAIL)),
            ("GIT_AUTHOR_DATE", date.clone()),
            ("GIT_COMMITTER_DATE", date),
            ("GIT_EDITOR", git_editor),
            (
                "PATH",
                std::env::var_os("PATH").unwrap_or_else(OsString::new),
            ),
        ];

        envs.into_iter()
            .map(|(key, value)| (OsString::from(key), value))
            .collect()
    }

    #[instrument]
    fn run_with_options_inner(
        &self,
        args: &[&str],
        options: &GitRunOptions,
    ) -> eyre::Result<(String, String)> {
        let GitRunOptions {
            time,
            expected_exit_code,
            input,
            env,
        } = options;

        let env: BTreeMap<_, _> = self
            .get_base_env(*time)
            .into_iter()
            .chain(
                env.iter()
                    .map(|(k, v)| (OsString::from(k), OsString::from(v))),
            )
            .collect();
        let mut command = Command::new(&self.path_to_git);
        command
            .current_dir(&self.repo_path)
            .args(args)
            .env_clear()
            .envs(&env);

        let output = if let Some(input) = input {
            use std::io::Write;
            use std::process::Stdio;
            command.stdin(Stdio::piped());
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
            let mut child = command.spawn().wrap_err("Spawning git")?;
            child
                .stdin
                .as_mut()
                .ok_or_else(|| eyre!("missing stdin"))?
                .write_all(input.as_bytes())?;
            child.wait_with_output().wrap_err("Waiting for git")?
        } else {
            command.output().wrap_err("Running git")?
        };

        let exit_code = output.status.code().unwrap_or(1);
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if exit_code != *expected_exit_code {
            eyre::bail!(
                "git {args:?} exited with {exit_code} (expected {expected_exit_code})\n\
                 stdout:\n{stdout}\n\
                 stderr:\n{stderr}",
            );
        }
        Ok((stdout, stderr))
    }

    /// Run Git with some custom options.
    pub fn run_with_options(
        &self,
        args: &[&str],
        options: &GitRunOptions,
    ) -> eyre::Result<(String, String)> {
        self.run_with_options_inner(args, options)
    }

    /// Run Git, expecting it to succeed.
    pub fn run(&self, args: &[&str]) -> eyre::Result<(String, String)> {
        self.run_with_options(args, &Default::default())
    }

    /// Set up a new repository at the wrapped path, with an initial commit
    /// on `main`.
    pub fn init_repo(&self) -> eyre::Result<()> {
        self.run(&["init"])?;
        self.run(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        self.run(&["config", "user.name", DUMMY_NAME])?;
        self.run(&["config", "user.email", DUMMY_EMAIL])?;
        self.commit_file("initial", 0)?;
        Ok(())
    }

    /// Write the given contents to the given file, creating parent
    /// directories as needed.
    pub fn write_file(&self, name: &str, contents: &str) -> eyre::Result<()> {
        let path = self.repo_path.join(name);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Commit a file with the given contents.
    pub fn commit_file_with_contents(
        &self,
        name: &str,
        time: isize,
        contents: &str,
    ) -> eyre::Result<NonZeroOid> {
        let file_name = format!("{name}.txt");
        self.write_file(&file_name, contents)?;
        self.run(&["add", &file_name])?;
        let message = format!("create {file_name}");
        self.run_with_options(
            &["commit", "-m", &message],
            &GitRunOptions {
                time,
                ..Default::default()
            },
        )?;
        self.resolve("HEAD")
    }

    /// Commit a file with default contents.
    pub fn commit_file(&self, name: &str, time: isize) -> eyre::Result<NonZeroOid> {
        self.commit_file_with_contents(name, time, &format!("{name} contents\n"))
    }

    /// Resolve a revision to a commit OID.
    pub fn resolve(&self, reference: &str) -> eyre::Result<NonZeroOid> {
        let (stdout, _stderr) = self.run(&["rev-parse", &format!("{reference}^{{commit}}")])?;
        Ok(stdout.trim().parse()?)
    }

    /// The `GitRunInfo` for invoking Git against this repository with the
    /// test environment.
    pub fn run_info(&self) -> GitRunInfo {
        GitRunInfo {
            path_to_git: self.path_to_git.clone(),
            env: self.get_base_env(0).into_iter().collect(),
        }
    }

    /// Open the test repository through the adapter.
    pub fn get_repo(&self) -> eyre::Result<Repo> {
        Ok(Repo::from_dir(&self.repo_path, self.run_info())?)
    }
}

/// Wrapper around a `Git` instance which owns the temporary directory it
/// lives in.
pub struct GitWrapper {
    _temp_dir: TempDir,
    git: Git,
}

impl Deref for GitWrapper {
    type Target = Git;

    fn deref(&self) -> &Self::Target {
        &self.git
    }
}

/// Create a [`Git`] instance in a fresh temporary directory.
pub fn make_git() -> eyre::Result<GitWrapper> {
    let temp_dir = tempfile::tempdir().wrap_err("Creating temporary directory")?;
    let repo_path = temp_dir.path().join("repo");
    std::fs::create_dir_all(&repo_path)?;
    let path_to_git =
        get_from_path("git").ok_or_else(|| eyre!("could not find `git` on PATH"))?;
    Ok(GitWrapper {
        _temp_dir: temp_dir,
        git: Git {
            repo_path,
            path_to_git,
        },
    })
}

/// Builders for synthetic repository snapshots, used by the unit tests for
/// the pure components.
pub mod snapshots {
    use indexmap::IndexMap;

    use crate::git::{BranchInfo, CommitDetails, NonZeroOid, RepoSnapshot, WorktreeInfo};

    /// A fake OID made by repeating a single hex digit 40 times.
    pub fn test_oid(digit: char) -> NonZeroOid {
        assert!(
            digit.is_ascii_hexdigit(),
            "test OIDs must use hex digits, got {digit:?}"
        );
        std::iter::repeat(digit)
            .take(40)
            .collect::<String>()
            .parse()
            .expect("test OID")
    }

    struct BranchSpec {
        name: String,
        head: char,
        is_trunk: bool,
        is_remote: bool,
    }

    /// Builds a [`RepoSnapshot`] from single-character commit names.
    #[derive(Default)]
    pub struct SnapshotBuilder {
        commits: Vec<(char, Option<char>)>,
        branches: Vec<BranchSpec>,
        worktrees: Vec<WorktreeInfo>,
    }

    impl SnapshotBuilder {
        /// An empty builder.
        pub fn new() -> Self {
            Default::default()
        }

        /// Add a commit with an optional parent. Declaration order becomes
        /// commit-time order.
        pub fn commit(mut self, name: char, parent: Option<char>) -> Self {
            self.commits.push((name, parent));
            self
        }

        /// Add a local branch pointing at the given commit.
        pub fn branch(mut self, name: &str, head: char) -> Self {
            self.branches.push(BranchSpec {
                name: name.to_string(),
                head,
                is_trunk: false,
                is_remote: false,
            });
            self
        }

        /// Add a local branch explicitly flagged as trunk.
        pub fn trunk_branch(mut self, name: &str, head: char) -> Self {
            self.branches.push(BranchSpec {
                name: name.to_string(),
                head,
                is_trunk: true,
                is_remote: false,
            });
            self
        }

        /// Add a remote-tracking branch (name like `origin/main`).
        pub fn remote_branch(mut self, name: &str, head: char) -> Self {
            self.branches.push(BranchSpec {
                name: name.to_string(),
                head,
                is_trunk: false,
                is_remote: true,
            });
            self
        }

        /// Add a worktree record.
        pub fn worktree(mut self, worktree: WorktreeInfo) -> Self {
            self.worktrees.push(worktree);
            self
        }

        /// Assemble the snapshot.
        pub fn build(self) -> RepoSnapshot {
            let mut commits = IndexMap::new();
            for (index, (name, parent)) in self.commits.iter().enumerate() {
                let oid = test_oid(*name);
                commits.insert(
                    oid.clone(),
                    CommitDetails {
                        oid,
                        parent_oid: parent.map(test_oid),
                        message: format!("commit {name}"),
                        author: "Testy McTestface <test@example.com>".to_string(),
                        committer: "Testy McTestface <test@example.com>".to_string(),
                        time_ms: u64::try_from(index).unwrap_or(0) * 1_000,
                    },
                );
            }
            let branches = self
                .branches
                .into_iter()
                .map(|spec| BranchInfo {
                    reference_name: if spec.is_remote {
                        format!("refs/remotes/{}", spec.name)
                    } else {
                        format!("refs/heads/{}", spec.name)
                    },
                    short_name: spec.name,
                    head_oid: test_oid(spec.head),
                    is_trunk: spec.is_trunk,
                    is_remote: spec.is_remote,
                })
                .collect();
            RepoSnapshot {
                commits,
                branches,
                worktrees: self.worktrees,
            }
        }
    }
}
