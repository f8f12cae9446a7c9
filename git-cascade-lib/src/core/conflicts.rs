//! Detecting unresolved Git conflict markers in file contents.

use std::path::Path;

use tracing::debug;

const CONFLICT_START: &str = "<<<<<<< ";
const CONFLICT_SEPARATOR: &str = "=======";
const CONFLICT_END: &str = ">>>>>>> ";

/// Whether the given contents still carry an unresolved Git conflict.
///
/// A conflict is unresolved only when all three marker kinds appear at the
/// start of a line: `<<<<<<< `, a bare `=======` line, and `>>>>>>> `. If
/// any one of them is missing, the remainder is treated as literal text and
/// the contents count as resolved.
pub fn content_has_conflict_markers(contents: &str) -> bool {
    let mut has_start = false;
    let mut has_separator = false;
    let mut has_end = false;
    for line in contents.lines() {
        if line.starts_with(CONFLICT_START) {
            has_start = true;
        } else if line == CONFLICT_SEPARATOR {
            has_separator = true;
        } else if line.starts_with(CONFLICT_END) {
            has_end = true;
        }
    }
    has_start && has_separator && has_end
}

/// Whether the file at `path` still carries an unresolved Git conflict.
/// Unreadable (missing, binary, non-UTF-8) files are treated as resolved.
pub fn file_has_conflict_markers(path: &Path) -> bool {
    match std::fs::read_to_string(path) {
        Ok(contents) => content_has_conflict_markers(&contents),
        Err(err) => {
            debug!(?path, ?err, "treating unreadable file as resolved");
            false
        }
    }
}
