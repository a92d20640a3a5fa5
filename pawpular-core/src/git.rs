//! Source revision lookup for run tagging.

use std::path::Path;

use crate::error::CoreError;

/// Hex SHA of `HEAD` for the repository containing `dir`.
///
/// Parent directories are searched, so any path inside a work tree works.
pub fn commit_hash(dir: &Path) -> Result<String, CoreError> {
    let repo = git2::Repository::discover(dir)
        .map_err(|e| CoreError::Git(format!("Failed to open repo: {e}")))?;
    let head = repo
        .head()
        .map_err(|e| CoreError::Git(format!("Failed to get HEAD: {e}")))?;
    let commit = head
        .peel_to_commit()
        .map_err(|e| CoreError::Git(format!("HEAD is not a commit: {e}")))?;
    Ok(commit.id().to_string())
}
