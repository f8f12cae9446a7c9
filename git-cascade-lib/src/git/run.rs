//! Running the Git executable as a subprocess.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{Read, Write as WriteIo};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use eyre::{eyre, Context};
use itertools::Itertools;
use tracing::instrument;

use crate::util::get_from_path;

/// Path to the `git` executable on disk to be executed.
#[derive(Clone)]
pub struct GitRunInfo {
    /// The path to the Git executable on disk.
    pub path_to_git: PathBuf,

    /// The environment variables that should be passed to the Git process.
    pub env: HashMap<OsString, OsString>,
}

impl std::fmt::Debug for GitRunInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<GitRunInfo path_to_git={:?} env=not shown>",
            self.path_to_git
        )
    }
}

impl GitRunInfo {
    /// Construct a `GitRunInfo` from the ambient environment, locating `git`
    /// on `PATH`.
    pub fn from_env() -> eyre::Result<Self> {
        let path_to_git =
            get_from_path("git").ok_or_else(|| eyre!("could not find `git` on PATH"))?;
        let env = std::env::vars_os().collect();
        Ok(GitRunInfo { path_to_git, env })
    }
}

/// Options for invoking Git.
#[derive(Debug)]
pub struct GitRunOpts {
    /// If set, a non-zero exit code will be treated as an error.
    pub treat_git_failure_as_error: bool,

    /// A vector of bytes to write to the Git process's stdin. If `None`,
    /// nothing is written to stdin.
    pub stdin: Option<Vec<u8>>,

    /// If set, the invocation is killed once this much wall-clock time has
    /// elapsed, and an error is returned.
    pub timeout: Option<Duration>,
}

impl Default for GitRunOpts {
    fn default() -> Self {
        Self {
            treat_git_failure_as_error: true,
            stdin: None,
            timeout: None,
        }
    }
}

/// The result of invoking Git.
pub struct GitRunResult {
    /// The exit code of the process.
    pub exit_code: i32,

    /// The stdout contents written by the invocation.
    pub stdout: Vec<u8>,

    /// The stderr contents written by the invocation.
    pub stderr: Vec<u8>,
}

impl GitRunResult {
    /// The stdout contents as UTF-8, with trailing whitespace removed.
    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim_end().to_string()
    }

    /// The stderr contents as (lossy) UTF-8.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl std::fmt::Debug for GitRunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<GitRunResult exit_code={:?} stdout={:?} stderr={:?}>",
            self.exit_code,
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr),
        )
    }
}

fn spawn_reader_thread<InputStream: Read + Send + 'static>(
    stream: Option<InputStream>,
) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buffer);
        }
        buffer
    })
}

impl GitRunInfo {
    fn run_silent_inner(
        &self,
        working_dir: &Path,
        args: &[&str],
        opts: GitRunOpts,
    ) -> eyre::Result<GitRunResult> {
        let GitRunInfo { path_to_git, env } = self;
        let GitRunOpts {
            treat_git_failure_as_error,
            stdin,
            timeout,
        } = opts;

        let command_string = format!("git {}", args.iter().join(" "));

        let mut command = Command::new(path_to_git);
        command.current_dir(working_dir);
        command.args(args);
        command.env_clear();
        command.envs(env.iter());
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .wrap_err_with(|| format!("Spawning Git subprocess: {command_string}"))?;

        if let Some(stdin) = stdin {
            child
                .stdin
                .as_mut()
                .ok_or_else(|| eyre!("could not open stdin for: {command_string}"))?
                .write_all(&stdin)
                .wrap_err("Writing process stdin")?;
            drop(child.stdin.take());
        }

        let stdout_thread = spawn_reader_thread(child.stdout.take());
        let stderr_thread = spawn_reader_thread(child.stderr.take());

        let exit_status = match timeout {
            None => child.wait().wrap_err("Waiting for Git subprocess")?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    match child.try_wait().wrap_err("Polling Git subprocess")? {
                        Some(exit_status) => break exit_status,
                        None => {
                            if Instant::now() >= deadline {
                                let _ = child.kill();
                                let _ = child.wait();
                                eyre::bail!(
                                    "Git subprocess timed out after {timeout:?}: {command_string}"
                                );
                            }
                            thread::sleep(Duration::from_millis(25));
                        }
                    }
                }
            }
        };

        let stdout = stdout_thread.join().map_err(|_| {
            eyre!("stdout reader thread panicked for: {command_string}")
        })?;
        let stderr = stderr_thread.join().map_err(|_| {
            eyre!("stderr reader thread panicked for: {command_string}")
        })?;

        let result = GitRunResult {
            // On Unix, if the child process was terminated by a signal, we
            // need to call some Unix-specific functions to access the signal
            // that terminated it. For simplicity, just return `1` in those
            // cases.
            exit_code: exit_status.code().unwrap_or(1),
            stdout,
            stderr,
        };
        if treat_git_failure_as_error && !exit_status.success() {
            eyre::bail!("Git subprocess failed: {command_string}: {result:?}");
        }
        Ok(result)
    }

    /// Run Git silently (don't display output to the user) in the provided
    /// working directory.
    ///
    /// Returns the output of the Git invocation.
    #[instrument]
    pub fn run_silent<S: AsRef<str> + std::fmt::Debug>(
        &self,
        working_dir: &Path,
        args: &[S],
        opts: GitRunOpts,
    ) -> eyre::Result<GitRunResult> {
        self.run_silent_inner(
            working_dir,
            args.iter().map(AsRef::as_ref).collect_vec().as_slice(),
            opts,
        )
    }
}
