//! The durable rebase session record.
//!
//! One record exists per repository, inside its Git directory. It is the
//! only crash-recovery mechanism: everything needed to continue or abort a
//! suspended rebase must round-trip through it. Writes are atomic
//! (write-to-temp-then-rename), and readers tolerate partial or garbage
//! content by treating it as absent.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::core::intent::RebaseIntent;
use crate::core::rewrite::RebaseState;
use crate::git::Repo;

/// The session record's file name within the repository's Git directory.
pub const SESSION_FILE_NAME: &str = "cascade-session.json";

/// A worktree whose branch was detached so the rebase could proceed, to be
/// restored afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoDetachedWorktree {
    /// The worktree's path.
    pub path: PathBuf,

    /// The branch that was checked out there.
    pub branch: String,
}

/// Everything persisted for an in-flight rebase.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRebaseSession {
    /// The intent being executed.
    pub intent: RebaseIntent,

    /// The state machine's current state.
    pub state: RebaseState,

    /// The branch checked out when the rebase started, to be restored on
    /// completion.
    pub original_branch: Option<String>,

    /// Worktrees detached during preparation, to be restored afterwards.
    pub auto_detached_worktrees: Vec<AutoDetachedWorktree>,
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a rebase session already exists for the repository at {path:?}")]
    AlreadyExists { path: PathBuf },

    #[error("could not persist session record to {path:?}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not serialize session record: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn session_path(repo: &Repo) -> PathBuf {
    repo.get_git_dir().join(SESSION_FILE_NAME)
}

pub(crate) fn write_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| std::io::Error::other("record path has no parent directory"))?;
    let mut temp_file = NamedTempFile::new_in(dir)?;
    temp_file.write_all(contents.as_bytes())?;
    temp_file.flush()?;
    temp_file.persist(path)?;
    Ok(())
}

/// Persist a new session record. Fails if one already exists.
#[instrument(skip(session))]
pub fn create_session(repo: &Repo, session: &StoredRebaseSession) -> Result<(), SessionError> {
    let path = session_path(repo);
    if get_session(repo).is_some() {
        return Err(SessionError::AlreadyExists { path });
    }
    let contents = serde_json::to_string_pretty(session)?;
    write_atomically(&path, &contents).map_err(|source| SessionError::Persist {
        path: path.clone(),
        source,
    })
}

/// Read the session record, if a well-formed one exists.
#[instrument]
pub fn get_session(repo: &Repo) -> Option<StoredRebaseSession> {
    let path = session_path(repo);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(_) => return None,
    };
    match serde_json::from_str(&contents) {
        Ok(session) => Some(session),
        Err(err) => {
            warn!(?path, ?err, "malformed session record; treating as absent");
            None
        }
    }
}

/// Replace the state field of the stored session. Failures are logged but
/// do not fail the caller; the in-memory state remains authoritative until
/// the next write.
#[instrument(skip(state))]
pub fn update_state(repo: &Repo, state: &RebaseState) {
    let Some(mut session) = get_session(repo) else {
        warn!("no session record to update");
        return;
    };
    session.state = state.clone();
    let path = session_path(repo);
    let result = serde_json::to_string_pretty(&session)
        .map_err(std::io::Error::other)
        .and_then(|contents| write_atomically(&path, &contents));
    if let Err(err) = result {
        warn!(?path, ?err, "could not persist session state");
    }
}

/// Remove the session record. Idempotent.
#[instrument]
pub fn clear_session(repo: &Repo) {
    let path = session_path(repo);
    if let Err(err) = std::fs::remove_file(&path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(?path, ?err, "could not remove session record");
        }
    }
}

/// Zero out the stored auto-detached-worktree list, leaving the rest of
/// the record in place.
#[instrument]
pub fn clear_auto_detached_worktrees(repo: &Repo) {
    let Some(mut session) = get_session(repo) else {
        return;
    };
    session.auto_detached_worktrees.clear();
    let path = session_path(repo);
    let result = serde_json::to_string_pretty(&session)
        .map_err(std::io::Error::other)
        .and_then(|contents| write_atomically(&path, &contents));
    if let Err(err) = result {
        warn!(?path, ?err, "could not persist session record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::intent::build_rebase_intent;
    use crate::core::rewrite::{create_rebase_plan, JobIdGenerator};
    use crate::testing::snapshots::{test_oid, SnapshotBuilder};
    use crate::testing::make_git;

    fn sample_session() -> StoredRebaseSession {
        let snapshot = SnapshotBuilder::new()
            .commit('a', None)
            .commit('b', Some('a'))
            .commit('d', Some('a'))
            .branch("main", 'd')
            .branch("feature", 'b')
            .build();
        let intent = build_rebase_intent(&snapshot, &test_oid('b'), &test_oid('d'), 1_000)
            .unwrap()
            .unwrap();
        let mut ids = JobIdGenerator::new();
        let state = create_rebase_plan(&snapshot, &intent, &mut ids, 1_000).unwrap();
        StoredRebaseSession {
            intent,
            state,
            original_branch: Some("main".to_string()),
            auto_detached_worktrees: vec![AutoDetachedWorktree {
                path: "/tmp/somewhere".into(),
                branch: "feature".to_string(),
            }],
        }
    }

    #[test]
    fn test_session_round_trip() -> eyre::Result<()> {
        let git = make_git()?;
        git.init_repo()?;
        let repo = git.get_repo()?;

        assert_eq!(get_session(&repo), None);

        let session = sample_session();
        create_session(&repo, &session).unwrap();
        assert_eq!(get_session(&repo), Some(session.clone()));

        // A second create fails while the record exists.
        assert!(matches!(
            create_session(&repo, &session),
            Err(SessionError::AlreadyExists { .. })
        ));

        let mut state = session.state.clone();
        state.next_job(2_000).unwrap();
        update_state(&repo, &state);
        let updated = get_session(&repo).unwrap();
        assert_eq!(updated.state, state);
        assert_eq!(updated.intent, session.intent);

        clear_auto_detached_worktrees(&repo);
        assert_eq!(
            get_session(&repo).unwrap().auto_detached_worktrees,
            Vec::new()
        );

        clear_session(&repo);
        assert_eq!(get_session(&repo), None);
        // Clearing again is fine.
        clear_session(&repo);
        Ok(())
    }

    #[test]
    fn test_malformed_record_is_treated_as_absent() -> eyre::Result<()> {
        let git = make_git()?;
        git.init_repo()?;
        let repo = git.get_repo()?;

        std::fs::write(repo.get_git_dir().join(SESSION_FILE_NAME), "{not json")?;
        assert_eq!(get_session(&repo), None);

        // A fresh create overwrites the garbage.
        let session = sample_session();
        create_session(&repo, &session).unwrap();
        assert_eq!(get_session(&repo), Some(session));
        Ok(())
    }
}
