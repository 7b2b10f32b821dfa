//! File-list side file.
//!
//! The export walks the staging tree once into a newline-delimited list;
//! the archive writer then streams that list from any byte offset instead of
//! holding the whole tree in memory. One line per entry, relative to the
//! walked root, `/`-separated; directory lines end with `/`.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::budget::TimeBudget;
use crate::error::{Result, SiteportError};
use crate::state::ProgressState;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListItem {
    pub rel: String,
    pub is_dir: bool,
}

impl ListItem {
    fn to_line(&self) -> String {
        if self.is_dir {
            format!("{}/\n", self.rel)
        } else {
            format!("{}\n", self.rel)
        }
    }

    fn from_line(line: &str) -> Option<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        if line.is_empty() {
            return None;
        }
        Some(match line.strip_suffix('/') {
            Some(rel) => ListItem {
                rel: rel.to_string(),
                is_dir: true,
            },
            None => ListItem {
                rel: line.to_string(),
                is_dir: false,
            },
        })
    }
}

/// Deterministic walk of `root`, root itself excluded.
pub fn walk_sorted(root: &Path) -> walkdir::IntoIter {
    WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
}

/// `/`-joined path of `path` below `root`.
pub fn rel_string(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for c in rel.components() {
        parts.push(c.as_os_str().to_str()?);
    }
    Some(parts.join("/"))
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListCursor {
    pub done: bool,
    /// Walk positions consumed so far, listed or not.
    pub entries_written: u64,
    /// Committed length of the list file.
    pub file_size: u64,
    pub skipped: u64,
}

impl ListCursor {
    pub fn from_state(s: &ProgressState) -> Self {
        Self {
            done: false,
            entries_written: s.list.list_entries_written.unwrap_or(0),
            file_size: s.list.list_file_size.unwrap_or(0),
            skipped: 0,
        }
    }

    pub fn apply(&self, s: &mut ProgressState) {
        if self.done {
            s.list = Default::default();
        } else {
            s.list.list_entries_written = Some(self.entries_written);
            s.list.list_file_size = Some(self.file_size);
        }
    }
}

/// Append walk entries of `root` to `list`, resuming after `resume.entries_written`.
///
/// The list is truncated to the committed length first, so a batch that
/// died after writing but before its cursor was saved leaves no duplicates.
pub fn write_file_list(
    root: &Path,
    list: &Path,
    resume: &ListCursor,
    budget: &TimeBudget,
) -> Result<ListCursor> {
    if !root.is_dir() {
        return Err(SiteportError::DirOpen {
            path: root.display().to_string(),
            reason: "not a directory".into(),
        });
    }
    let mut out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(list)
        .map_err(|e| SiteportError::FileOpen {
            path: list.display().to_string(),
            reason: e.to_string(),
        })?;
    out.set_len(resume.file_size)?;
    out.seek(SeekFrom::End(0))?;

    let mut cur = ListCursor {
        done: false,
        ..resume.clone()
    };
    let mut walk = walk_sorted(root).skip(resume.entries_written as usize);
    loop {
        let Some(entry) = walk.next() else {
            cur.done = true;
            break;
        };
        let entry = entry.map_err(|e| SiteportError::DirOpen {
            path: root.display().to_string(),
            reason: e.to_string(),
        })?;
        cur.entries_written += 1;

        let ft = entry.file_type();
        let rel = rel_string(root, entry.path()).filter(|r| !r.contains('\n'));
        match (rel, ft.is_dir() || ft.is_file()) {
            (Some(rel), true) => {
                let line = ListItem {
                    rel,
                    is_dir: ft.is_dir(),
                }
                .to_line();
                out.write_all(line.as_bytes())?;
                cur.file_size += line.len() as u64;
            }
            _ => {
                warn!(path = %entry.path().display(), "not listed: unsupported name or file type");
                cur.skipped += 1;
            }
        }

        if budget.exceeded() {
            break;
        }
    }
    out.flush()?;
    out.sync_data()?;

    if cur.done {
        info!(entries = cur.entries_written, bytes = cur.file_size, "file list complete");
    } else {
        debug!(entries = cur.entries_written, bytes = cur.file_size, "file list batch ended");
    }
    Ok(cur)
}

/// Streams a list file from a byte offset.
pub struct FileListReader {
    r: BufReader<File>,
    pos: u64,
}

impl FileListReader {
    pub fn open(path: &Path, offset: u64) -> Result<Self> {
        let mut f = File::open(path).map_err(|e| SiteportError::FileOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        f.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            r: BufReader::new(f),
            pos: offset,
        })
    }

    /// Offset of the next unread line.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn next_item(&mut self) -> Result<Option<ListItem>> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = self.r.read_until(b'\n', &mut buf)?;
            if n == 0 {
                return Ok(None);
            }
            if buf.last() != Some(&b'\n') {
                return Err(SiteportError::Format("file list ends mid-line".into()));
            }
            self.pos += n as u64;
            let line = std::str::from_utf8(&buf)
                .map_err(|e| SiteportError::Format(format!("file list: {e}")))?;
            if let Some(item) = ListItem::from_line(line) {
                return Ok(Some(item));
            }
        }
    }
}
