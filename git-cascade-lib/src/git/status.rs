//! Parsing the state of the working copy.

use std::path::PathBuf;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

use super::oid::{MaybeZeroOid, NonZeroOid};

/// The state of one path in a single porcelain v2 status column (the index
/// side or the working-copy side of an entry).
///
/// This is deliberately coarser than Git's own indicator set: the engine
/// only needs to know which bucket of [`WorkingTreeStatus`] a path lands
/// in, so states it never tells apart collapse into one variant.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileStatus {
    Unchanged,
    Modified,
    Added,
    Deleted,
    Renamed,
    Unmerged,
    Untracked,
}

impl From<u8> for FileStatus {
    fn from(column: u8) -> Self {
        match column {
            b'.' => FileStatus::Unchanged,
            // A type change (regular file <-> symlink) rewrites the
            // file's contents.
            b'M' | b'T' => FileStatus::Modified,
            b'A' => FileStatus::Added,
            b'D' => FileStatus::Deleted,
            // Copies are folded into renames.
            b'R' | b'C' => FileStatus::Renamed,
            b'U' => FileStatus::Unmerged,
            b'?' => FileStatus::Untracked,
            _ => {
                warn!(?column, "unrecognized status column");
                FileStatus::Unchanged
            }
        }
    }
}

/// The status of a file in the repo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusEntry {
    /// The status of the file in the index.
    pub index_status: FileStatus,

    /// The status of the file in the working copy.
    pub working_copy_status: FileStatus,

    /// The file path.
    pub path: PathBuf,

    /// The original path of the file (for renamed files).
    pub orig_path: Option<PathBuf>,
}

impl StatusEntry {
    /// Parses an entry of the git porcelain v2 status format.
    /// See <https://git-scm.com/docs/git-status#_porcelain_format_version_2>.
    ///
    /// Returns `None` for lines which are not file entries (headers,
    /// ignored files).
    pub fn parse(line: &str) -> Option<StatusEntry> {
        lazy_static! {
            static ref ORDINARY_RE: Regex = Regex::new(concat!(
                r"^1 (?P<index_status>[\w.])(?P<working_copy_status>[\w.]) ",
                r"[\w.]+ (?:\d{6} ){3}[0-9a-f]+ [0-9a-f]+ (?P<path>.+)$",
            ))
            .expect("porcelain v2 ordinary entry regex");
            static ref RENAMED_RE: Regex = Regex::new(concat!(
                r"^2 (?P<index_status>[\w.])(?P<working_copy_status>[\w.]) ",
                r"[\w.]+ (?:\d{6} ){3}[0-9a-f]+ [0-9a-f]+ [RC]\d+ ",
                r"(?P<path>[^\t]+)\t(?P<orig_path>.+)$",
            ))
            .expect("porcelain v2 renamed entry regex");
            static ref UNMERGED_RE: Regex = Regex::new(concat!(
                r"^u (?P<index_status>[\w.])(?P<working_copy_status>[\w.]) ",
                r"[\w.]+ (?:\d{6} ){4}(?:[0-9a-f]+ ){3}(?P<path>.+)$",
            ))
            .expect("porcelain v2 unmerged entry regex");
        }

        if let Some(path) = line.strip_prefix("? ") {
            return Some(StatusEntry {
                index_status: FileStatus::Untracked,
                working_copy_status: FileStatus::Untracked,
                path: path.into(),
                orig_path: None,
            });
        }

        let captures = ORDINARY_RE
            .captures(line)
            .or_else(|| RENAMED_RE.captures(line))
            .or_else(|| UNMERGED_RE.captures(line))?;
        let status_byte = |name: &str| -> FileStatus {
            captures
                .name(name)
                .and_then(|m| m.as_str().bytes().next())
                .map(FileStatus::from)
                .unwrap_or(FileStatus::Unchanged)
        };
        let (index_status, working_copy_status) = if line.starts_with("u ") {
            (FileStatus::Unmerged, FileStatus::Unmerged)
        } else {
            (status_byte("index_status"), status_byte("working_copy_status"))
        };
        Some(StatusEntry {
            index_status,
            working_copy_status,
            path: captures["path"].into(),
            orig_path: captures
                .name("orig_path")
                .map(|orig_path| orig_path.as_str().into()),
        })
    }
}

/// The aggregated status of a working tree, as consumed by the rebase
/// engine.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkingTreeStatus {
    /// The branch currently checked out, if any.
    pub current_branch: Option<String>,

    /// The commit `HEAD` points to, if any (an unborn branch has none).
    pub current_commit: Option<NonZeroOid>,

    /// Whether `HEAD` is detached.
    pub detached: bool,

    /// Whether a rebase is underway in this working tree.
    pub is_rebasing: bool,

    /// Files with changes recorded in the index.
    pub staged: Vec<PathBuf>,

    /// Files modified in the index or working copy.
    pub modified: Vec<PathBuf>,

    /// Files newly added to the index.
    pub created: Vec<PathBuf>,

    /// Files deleted in the index or working copy.
    pub deleted: Vec<PathBuf>,

    /// Files renamed in the index.
    pub renamed: Vec<PathBuf>,

    /// Untracked files.
    pub not_added: Vec<PathBuf>,

    /// Files with unresolved merge conflicts.
    pub conflicted: Vec<PathBuf>,

    /// Every path with any kind of change, in the order reported by Git.
    pub all_changed_files: Vec<PathBuf>,
}

impl WorkingTreeStatus {
    /// Whether the working tree has no changes to tracked files. Untracked
    /// files do not count: they survive branch switches unharmed.
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty()
            && self.modified.is_empty()
            && self.created.is_empty()
            && self.deleted.is_empty()
            && self.renamed.is_empty()
            && self.conflicted.is_empty()
    }

    /// Parse the output of `git status --porcelain=v2 --branch`. The
    /// `is_rebasing` field is left `false`; it is not part of the porcelain
    /// format and must be filled in by the caller.
    pub fn parse(output: &str) -> Self {
        let mut status = WorkingTreeStatus::default();
        for line in output.lines() {
            if let Some(oid) = line.strip_prefix("# branch.oid ") {
                status.current_commit = oid
                    .parse::<MaybeZeroOid>()
                    .ok()
                    .and_then(MaybeZeroOid::into_option);
                continue;
            }
            if let Some(head) = line.strip_prefix("# branch.head ") {
                if head == "(detached)" {
                    status.detached = true;
                } else {
                    status.current_branch = Some(head.to_string());
                }
                continue;
            }
            if line.starts_with('#') {
                continue;
            }

            let entry = match StatusEntry::parse(line) {
                Some(entry) => entry,
                None => continue,
            };
            let StatusEntry {
                index_status,
                working_copy_status,
                path,
                orig_path: _,
            } = &entry;

            // Anything recorded on the index side is also staged.
            match index_status {
                FileStatus::Added => {
                    status.created.push(path.clone());
                    status.staged.push(path.clone());
                }
                FileStatus::Modified => {
                    status.modified.push(path.clone());
                    status.staged.push(path.clone());
                }
                FileStatus::Deleted => {
                    status.deleted.push(path.clone());
                    status.staged.push(path.clone());
                }
                FileStatus::Renamed => {
                    status.renamed.push(path.clone());
                    status.staged.push(path.clone());
                }
                FileStatus::Unmerged => status.conflicted.push(path.clone()),
                FileStatus::Untracked => status.not_added.push(path.clone()),
                FileStatus::Unchanged => {}
            }
            match working_copy_status {
                FileStatus::Modified if !status.modified.contains(path) => {
                    status.modified.push(path.clone());
                }
                FileStatus::Deleted if !status.deleted.contains(path) => {
                    status.deleted.push(path.clone());
                }
                _ => {}
            }
            if !status.all_changed_files.contains(path) {
                status.all_changed_files.push(path.clone());
            }
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_entry() {
        assert_eq!(
            StatusEntry::parse(
                "1 .M N... 100644 100644 100644 51fcbe2362663a19d132767b69c2c7829023f3da 51fcbe2362663a19d132767b69c2c7829023f3da repo.rs",
            ).unwrap(),
            StatusEntry {
                index_status: FileStatus::Unchanged,
                working_copy_status: FileStatus::Modified,
                path: "repo.rs".into(),
                orig_path: None,
            }
        );

        assert_eq!(
            StatusEntry::parse(
                "2 R. N... 100644 100644 100644 9daeafb9864cf43055ae93beb0afd6c7d144bfa4 9daeafb9864cf43055ae93beb0afd6c7d144bfa4 R100 new_file.rs\told_file.rs",
            ).unwrap(),
            StatusEntry {
                index_status: FileStatus::Renamed,
                working_copy_status: FileStatus::Unchanged,
                path: "new_file.rs".into(),
                orig_path: Some("old_file.rs".into()),
            }
        );

        assert_eq!(
            StatusEntry::parse(
                "u UU N... 100644 100644 100644 100644 51fcbe2362663a19d132767b69c2c7829023f3da 51fcbe2362663a19d132767b69c2c7829023f3da 51fcbe2362663a19d132767b69c2c7829023f3da f.txt",
            ).unwrap(),
            StatusEntry {
                index_status: FileStatus::Unmerged,
                working_copy_status: FileStatus::Unmerged,
                path: "f.txt".into(),
                orig_path: None,
            }
        );

        assert_eq!(
            StatusEntry::parse("? wip.txt").unwrap(),
            StatusEntry {
                index_status: FileStatus::Untracked,
                working_copy_status: FileStatus::Untracked,
                path: "wip.txt".into(),
                orig_path: None,
            }
        );

        assert_eq!(StatusEntry::parse("# branch.head main"), None);
    }

    #[test]
    fn test_collapsed_status_columns() {
        // Type changes read as modifications; copies read as renames.
        assert_eq!(FileStatus::from(b'T'), FileStatus::Modified);
        assert_eq!(FileStatus::from(b'C'), FileStatus::Renamed);
        assert_eq!(FileStatus::from(b'#'), FileStatus::Unchanged);

        let entry = StatusEntry::parse(
            "2 C. N... 100644 100644 100644 9daeafb9864cf43055ae93beb0afd6c7d144bfa4 9daeafb9864cf43055ae93beb0afd6c7d144bfa4 C100 copy.rs\toriginal.rs",
        )
        .unwrap();
        assert_eq!(entry.index_status, FileStatus::Renamed);
        assert_eq!(entry.orig_path, Some("original.rs".into()));
    }

    #[test]
    fn test_parse_working_tree_status() {
        let output = "\
# branch.oid 4ec4fff0fa28a3597160cdb4a9a61e526dfbf27d
# branch.head main
1 M. N... 100644 100644 100644 51fcbe2362663a19d132767b69c2c7829023f3da 51fcbe2362663a19d132767b69c2c7829023f3da staged.rs
1 .M N... 100644 100644 100644 51fcbe2362663a19d132767b69c2c7829023f3da 51fcbe2362663a19d132767b69c2c7829023f3da dirty.rs
u UU N... 100644 100644 100644 100644 51fcbe2362663a19d132767b69c2c7829023f3da 51fcbe2362663a19d132767b69c2c7829023f3da 51fcbe2362663a19d132767b69c2c7829023f3da conflicted.rs
? wip.txt
";
        let status = WorkingTreeStatus::parse(output);
        assert_eq!(status.current_branch.as_deref(), Some("main"));
        assert!(!status.detached);
        assert_eq!(status.staged, vec![PathBuf::from("staged.rs")]);
        assert_eq!(
            status.modified,
            vec![PathBuf::from("staged.rs"), PathBuf::from("dirty.rs")]
        );
        assert_eq!(status.conflicted, vec![PathBuf::from("conflicted.rs")]);
        assert_eq!(status.not_added, vec![PathBuf::from("wip.txt")]);
        assert!(!status.is_clean());

        let clean = WorkingTreeStatus::parse(
            "# branch.oid 4ec4fff0fa28a3597160cdb4a9a61e526dfbf27d\n# branch.head main\n? wip.txt\n",
        );
        assert!(clean.is_clean());

        let detached = WorkingTreeStatus::parse(
            "# branch.oid 4ec4fff0fa28a3597160cdb4a9a61e526dfbf27d\n# branch.head (detached)\n",
        );
        assert!(detached.detached);
        assert_eq!(detached.current_branch, None);
    }
}
