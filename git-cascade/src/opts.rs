//! Command-line options.

use clap::{Parser, Subcommand};

/// Rebase stacked branches without losing your place.
#[derive(Debug, Parser)]
#[command(name = "git-cascade", version, about)]
pub struct Opts {
    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// The subcommands of `git-cascade`.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Move a branch, and every branch stacked on top of it, onto a new
    /// base commit.
    Move {
        /// The branch to move. Defaults to the current branch.
        #[arg(short = 's', long = "source")]
        source: Option<String>,

        /// The revision to move the branch onto.
        #[arg(short = 'd', long = "dest")]
        dest: String,
    },

    /// Continue a rebase paused on conflicts, after editing the
    /// conflicted files.
    #[command(name = "continue")]
    Continue,

    /// Abort the rebase and clear all session state.
    Abort,

    /// Skip the commit currently paused on conflicts and continue.
    Skip,

    /// Show the state of the current rebase session, if any.
    Status,

    /// Delete local branches which have been fully merged into the trunk.
    Cleanup,
}
