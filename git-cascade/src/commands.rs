//! Implementations of the CLI subcommands.

use lib::core::branches::cleanup_merged_branches;
use lib::core::intent::build_rebase_intent;
use lib::core::rewrite::{
    abort_rebase, continue_rebase, execute_rebase_intent, rebase_status, skip_commit,
    ExecuteRebaseResult, JobStatus,
};
use lib::git::{GitRunInfo, Repo};
use lib::util::{now_ms, ExitCode};

use crate::opts::{Command, Opts};

/// Run the requested subcommand, returning the process exit code.
pub fn dispatch(opts: Opts) -> eyre::Result<ExitCode> {
    let repo = open_repo()?;
    match opts.command {
        Command::Move { source, dest } => run_move(&repo, source.as_deref(), &dest),
        Command::Continue => render_result(continue_rebase(&repo)?),
        Command::Skip => render_result(skip_commit(&repo)?),
        Command::Abort => {
            abort_rebase(&repo)?;
            println!("Rebase aborted.");
            Ok(ExitCode(0))
        }
        Command::Status => run_status(&repo),
        Command::Cleanup => run_cleanup(&repo),
    }
}

fn open_repo() -> eyre::Result<Repo> {
    let run_info = GitRunInfo::from_env()?;
    let current_dir = std::env::current_dir()?;
    Ok(Repo::from_dir(&current_dir, run_info)?)
}

fn run_move(repo: &Repo, source: Option<&str>, dest: &str) -> eyre::Result<ExitCode> {
    let snapshot = repo.snapshot()?;

    let source = source.unwrap_or("HEAD");
    let Some(head_oid) = repo.resolve_ref(source)? else {
        eprintln!("error: could not resolve source revision {source:?}");
        return Ok(ExitCode(1));
    };
    let Some(base_oid) = repo.resolve_ref(dest)? else {
        eprintln!("error: could not resolve destination revision {dest:?}");
        return Ok(ExitCode(1));
    };

    let intent = match build_rebase_intent(&snapshot, &head_oid, &base_oid, now_ms()) {
        Ok(Some(intent)) => intent,
        Ok(None) => {
            println!("Nothing to do: the branch is already based there.");
            return Ok(ExitCode(0));
        }
        Err(err) => {
            eprintln!("error: {err}");
            return Ok(ExitCode(1));
        }
    };

    let branches = intent.all_branches();
    println!(
        "Rebasing {} branch{}: {}",
        branches.len(),
        if branches.len() == 1 { "" } else { "es" },
        branches.join(", "),
    );

    render_result(execute_rebase_intent(repo, &snapshot, &intent)?)
}

fn render_result(result: ExecuteRebaseResult) -> eyre::Result<ExitCode> {
    match result {
        ExecuteRebaseResult::Completed { state, warnings } => {
            let completed = state
                .jobs_by_id
                .values()
                .filter(|job| {
                    matches!(job.status, JobStatus::Completed | JobStatus::Skipped)
                })
                .count();
            println!(
                "Done: {completed} branch{} rebased, {} commit{} rewritten.",
                if completed == 1 { "" } else { "es" },
                state.session.commit_map.len(),
                if state.session.commit_map.len() == 1 {
                    ""
                } else {
                    "s"
                },
            );
            for warning in warnings {
                eprintln!("warning: {warning}");
            }
            Ok(ExitCode(0))
        }

        ExecuteRebaseResult::Conflict { conflicted_paths } => {
            println!("Conflicts in:");
            for path in conflicted_paths {
                println!("  {}", path.display());
            }
            println!("Resolve them, then run `git cascade continue` (or `abort`, or `skip`).");
            Ok(ExitCode(1))
        }

        ExecuteRebaseResult::Invalid(validation_error) => {
            eprintln!("{}: {validation_error}", validation_error.code());
            Ok(ExitCode(1))
        }
    }
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::InProgress => "in progress",
        JobStatus::AwaitingUser => "awaiting user",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Skipped => "skipped",
    }
}

fn run_status(repo: &Repo) -> eyre::Result<ExitCode> {
    let report = rebase_status(repo)?;
    if !report.has_session && !report.is_rebasing {
        println!("No rebase in progress.");
        return Ok(ExitCode(0));
    }

    if let Some(state) = &report.state {
        println!("Rebase session {} is {}.", state.session.id, match state.session.status {
            lib::core::rewrite::SessionStatus::Running => "running",
            lib::core::rewrite::SessionStatus::AwaitingUser => "waiting for conflict resolution",
            lib::core::rewrite::SessionStatus::Completed => "completed",
            lib::core::rewrite::SessionStatus::Aborted => "aborted",
        });
        for job in state.jobs_by_id.values() {
            println!("  {}: {}", job.branch, status_label(job.status));
        }
    } else if report.is_rebasing {
        println!("A rebase is in progress, but it was not started by git-cascade.");
    }

    if !report.conflicted_paths.is_empty() {
        println!("Conflicted files:");
        for path in &report.conflicted_paths {
            println!("  {}", path.display());
        }
    }
    if let Some(progress) = &report.progress {
        println!(
            "Rebase step {}/{}{}.",
            progress.current_step,
            progress.total_steps,
            progress
                .branch
                .as_deref()
                .map(|branch| format!(" on {branch}"))
                .unwrap_or_default(),
        );
    }
    Ok(ExitCode(0))
}

fn run_cleanup(repo: &Repo) -> eyre::Result<ExitCode> {
    let snapshot = repo.snapshot()?;
    match cleanup_merged_branches(repo, &snapshot, None) {
        Ok(deleted) if deleted.is_empty() => {
            println!("No fully-merged branches to clean up.");
            Ok(ExitCode(0))
        }
        Ok(deleted) => {
            for branch in deleted {
                println!("Deleted branch {branch}.");
            }
            Ok(ExitCode(0))
        }
        Err(err) => {
            eprintln!("error: {err}");
            Ok(ExitCode(1))
        }
    }
}
