use std::fs;
use std::path::Path;

use tracing::debug;
use walkdir::WalkDir;

use crate::budget::TimeBudget;
use crate::error::{Result, SiteportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Done,
    /// Budget ran out; call again to continue.
    Retry,
}

/// Remove `path` and everything below it, children first, checking the
/// budget after every removal. A missing path is already deleted.
pub fn delete_tree(path: &Path, budget: &TimeBudget) -> Result<DeleteOutcome> {
    let md = match fs::symlink_metadata(path) {
        Ok(md) => md,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(DeleteOutcome::Done),
        Err(e) => return Err(e.into()),
    };
    if !md.is_dir() {
        fs::remove_file(path)?;
        return Ok(DeleteOutcome::Done);
    }

    let mut removed = 0u64;
    for entry in WalkDir::new(path).contents_first(true).follow_links(false) {
        let entry = entry.map_err(|e| SiteportError::DirOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
        removed += 1;
        if entry.depth() > 0 && budget.exceeded() {
            debug!(path = %path.display(), removed, "delete batch ended");
            return Ok(DeleteOutcome::Retry);
        }
    }
    Ok(DeleteOutcome::Done)
}
