//! Resumable tree copy.
//!
//! The walk order is fixed (siblings by name), so the relative path of the
//! last handled file is enough to find the resume point again, even when that
//! file has since disappeared.

pub mod delete;
pub mod exclude;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::batch::BatchPolicy;
use crate::budget::TimeBudget;
use crate::copy::exclude::ExcludeRules;
use crate::error::{Result, SiteportError};
use crate::pack::walker::{rel_string, walk_sorted};
use crate::state::ProgressState;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CopyCursor {
    pub done: bool,
    pub processed: u64,
    pub failed: u64,
    /// Bytes of `under_copy` already copied; only set while a large file is mid-copy.
    pub chunked_offset: Option<u64>,
    pub under_copy: Option<String>,
    /// Failed files already behind the resume point.
    pub retry: Vec<String>,
    pub error: Option<String>,
}

impl CopyCursor {
    pub fn from_state(s: &ProgressState) -> Self {
        Self {
            done: false,
            processed: s.copy.copydir_processed.unwrap_or(0),
            failed: s.copy.copydir_failed.unwrap_or(0),
            chunked_offset: s.copy.copychunked_offset,
            under_copy: s.copy.copychunked_under_copy.clone(),
            retry: s.copy.copydir_retry.clone().unwrap_or_default(),
            error: None,
        }
    }

    pub fn apply(&self, s: &mut ProgressState) {
        if self.done {
            s.copy = Default::default();
            return;
        }
        s.copy.copydir_processed = Some(self.processed);
        s.copy.copydir_failed = Some(self.failed);
        s.copy.copychunked_offset = self.chunked_offset;
        s.copy.copychunked_under_copy = self.under_copy.clone();
        s.copy.copydir_retry = (!self.retry.is_empty()).then(|| self.retry.clone());
    }
}

enum FileCopy {
    Copied,
    AlreadyThere,
    Suspended(u64),
}

pub struct ChunkedDirectoryCopier {
    policy: BatchPolicy,
    exclude: ExcludeRules,
}

impl ChunkedDirectoryCopier {
    pub fn new(policy: BatchPolicy, exclude: ExcludeRules) -> Self {
        Self { policy, exclude }
    }

    pub fn run(
        &self,
        src: &Path,
        dst: &Path,
        resume: &CopyCursor,
        budget: &TimeBudget,
    ) -> Result<CopyCursor> {
        let dir_err = |p: &Path, e: String| SiteportError::DirOpen {
            path: p.display().to_string(),
            reason: e,
        };
        fs::read_dir(src).map_err(|e| dir_err(src, e.to_string()))?;
        fs::create_dir_all(dst)?;

        let mut cur = CopyCursor {
            done: false,
            error: None,
            ..resume.clone()
        };
        let resume_at = resume.under_copy.as_deref().map(PathBuf::from);

        let mut walk = walk_sorted(src);
        while let Some(entry) = walk.next() {
            let entry = entry.map_err(|e| dir_err(src, e.to_string()))?;
            let Some(rel) = rel_string(src, entry.path()) else {
                warn!(path = %entry.path().display(), "skipping non-UTF-8 path");
                continue;
            };
            let is_dir = entry.file_type().is_dir();
            if self.exclude.matches(&rel) {
                debug!(path = %rel, "excluded");
                if is_dir {
                    walk.skip_current_dir();
                }
                continue;
            }

            let target = dst.join(&rel);
            if is_dir {
                fs::create_dir_all(&target)?;
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            let mut offset = 0;
            let mut behind = false;
            if let Some(at) = &resume_at {
                let here = Path::new(&rel);
                if here < at.as_path() || (here == at.as_path() && resume.chunked_offset.is_none()) {
                    if !cur.retry.contains(&rel) {
                        continue;
                    }
                    behind = true;
                } else if here == at.as_path() {
                    offset = resume.chunked_offset.unwrap_or(0);
                }
            }

            if behind {
                // retried whole: suspending here would move the resume point backwards
                match self.copy_file(entry.path(), &target, 0, &TimeBudget::unlimited()) {
                    Ok(_) => {
                        debug!(path = %rel, "retried copy succeeded");
                        cur.retry.retain(|r| r != &rel);
                        cur.failed = cur.failed.saturating_sub(1);
                        cur.processed += 1;
                    }
                    Err(e) => {
                        warn!(path = %rel, error = %e, "file still not copied");
                        cur.error = Some(format!("{rel}: {e}"));
                    }
                }
            } else {
                match self.copy_file(entry.path(), &target, offset, budget) {
                    Ok(FileCopy::Suspended(at)) => {
                        cur.chunked_offset = Some(at);
                        cur.under_copy = Some(rel);
                        debug!(processed = cur.processed, offset = at, "copy suspended mid-file");
                        return Ok(cur);
                    }
                    Ok(FileCopy::Copied) | Ok(FileCopy::AlreadyThere) => cur.processed += 1,
                    Err(e @ SiteportError::MissingResumeData(_)) => return Err(e),
                    Err(e) => {
                        warn!(path = %rel, error = %e, "file not copied");
                        cur.failed += 1;
                        cur.error = Some(format!("{rel}: {e}"));
                        cur.retry.push(rel.clone());
                    }
                }
                cur.chunked_offset = None;
                cur.under_copy = Some(rel);
            }

            if budget.exceeded() {
                debug!(processed = cur.processed, "copy batch ended");
                return Ok(cur);
            }
        }

        info!(
            from = %src.display(),
            to = %dst.display(),
            processed = cur.processed,
            failed = cur.failed,
            "tree copy complete"
        );
        cur.done = true;
        cur.chunked_offset = None;
        cur.under_copy = None;
        cur.retry.clear();
        Ok(cur)
    }

    fn copy_file(&self, src: &Path, dst: &Path, offset: u64, budget: &TimeBudget) -> Result<FileCopy> {
        let size = fs::metadata(src)?.len();
        if offset == 0 {
            if let Ok(md) = fs::metadata(dst) {
                if md.is_file() && md.len() == size {
                    return Ok(FileCopy::AlreadyThere);
                }
            }
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        if !self.policy.is_large(size) {
            fs::copy(src, dst)?;
            return Ok(FileCopy::Copied);
        }

        let mut input = File::open(src)?;
        input.seek(SeekFrom::Start(offset))?;
        let mut out = if offset == 0 {
            File::create(dst)?
        } else {
            resume_output(dst, offset)?
        };

        let mut buf = vec![0u8; self.policy.frame_bytes as usize];
        let mut done = offset;
        while done < size {
            let want = (size - done).min(buf.len() as u64) as usize;
            input.read_exact(&mut buf[..want])?;
            out.write_all(&buf[..want])?;
            done += want as u64;
            if done < size && budget.exceeded() {
                out.flush()?;
                return Ok(FileCopy::Suspended(done));
            }
        }
        out.flush()?;
        Ok(FileCopy::Copied)
    }
}

/// Reopen a half-copied file; it must still hold the `offset` bytes already copied.
fn resume_output(dst: &Path, offset: u64) -> Result<File> {
    let missing = |why: String| SiteportError::MissingResumeData(format!("{}: {why}", dst.display()));
    let mut out = OpenOptions::new()
        .write(true)
        .open(dst)
        .map_err(|e| missing(e.to_string()))?;
    let have = out.metadata()?.len();
    if have < offset {
        return Err(missing(format!("holds {have} bytes, {offset} already copied")));
    }
    out.set_len(offset)?;
    out.seek(SeekFrom::End(0))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::TickClock;
    use std::sync::Arc;

    fn policy() -> BatchPolicy {
        BatchPolicy {
            large_file_bytes: 1000,
            first_run_batch_bytes: 1 << 20,
            min_batch_bytes: 1 << 20,
            frame_bytes: 400,
        }
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("2024/01")).unwrap();
        fs::create_dir_all(src.join("cache")).unwrap();
        fs::write(src.join("2024/01/a.jpg"), b"aaaa").unwrap();
        fs::write(src.join("2024/01/b.jpg"), b"bbbb").unwrap();
        fs::write(src.join("2024/big.mov"), vec![9u8; 2000]).unwrap();
        fs::write(src.join("cache/tmp.bin"), b"cached").unwrap();
        fs::write(src.join("z.txt"), b"z").unwrap();
        dir
    }

    fn drain(src: &Path, dst: &Path, start: CopyCursor, budget: impl Fn() -> TimeBudget) -> (CopyCursor, u32) {
        let c = ChunkedDirectoryCopier::new(policy(), ExcludeRules::new(&["cache"]));
        let mut state = ProgressState::default();
        start.apply(&mut state);
        let mut calls = 0;
        loop {
            let cur = c.run(src, dst, &CopyCursor::from_state(&state), &budget()).unwrap();
            calls += 1;
            assert!(calls < 100);
            if cur.done {
                return (cur, calls);
            }
            cur.apply(&mut state);
        }
    }

    #[test]
    fn copies_tree_and_honours_exclusions() {
        let dir = tree();
        let (src, dst) = (dir.path().join("src"), dir.path().join("dst"));
        let (cur, calls) = drain(&src, &dst, CopyCursor::default(), TimeBudget::unlimited);
        assert_eq!(calls, 1);
        assert_eq!(cur.processed, 4);
        assert_eq!(fs::read(dst.join("2024/big.mov")).unwrap(), vec![9u8; 2000]);
        assert!(!dst.join("cache").exists());
    }

    #[test]
    fn one_file_per_call_and_large_files_by_chunk() {
        let dir = tree();
        let (src, dst) = (dir.path().join("src"), dir.path().join("dst"));
        let (cur, calls) = drain(&src, &dst, CopyCursor::default(), || {
            TimeBudget::start(Arc::new(TickClock::new(1.0)), 0.5)
        });
        // a.jpg, b.jpg, big.mov in 5 chunks, z.txt, then an empty pass
        assert_eq!(calls, 1 + 1 + 5 + 1 + 1);
        assert_eq!(cur.processed, 4);
        assert_eq!(fs::read(dst.join("2024/big.mov")).unwrap(), vec![9u8; 2000]);
    }

    #[test]
    fn existing_destination_files_are_not_copied_again() {
        let dir = tree();
        let (src, dst) = (dir.path().join("src"), dir.path().join("dst"));
        // a prior run got the first two files over, then lost its cursor
        fs::create_dir_all(dst.join("2024/01")).unwrap();
        fs::copy(src.join("2024/01/a.jpg"), dst.join("2024/01/a.jpg")).unwrap();
        fs::copy(src.join("2024/01/b.jpg"), dst.join("2024/01/b.jpg")).unwrap();
        let before = fs::metadata(dst.join("2024/01/a.jpg")).unwrap().modified().unwrap();

        let (cur, _) = drain(&src, &dst, CopyCursor::default(), TimeBudget::unlimited);
        assert_eq!(cur.processed, 4);
        let after = fs::metadata(dst.join("2024/01/a.jpg")).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn resume_point_survives_a_vanished_file() {
        let dir = tree();
        let (src, dst) = (dir.path().join("src"), dir.path().join("dst"));
        let start = CopyCursor {
            processed: 2,
            under_copy: Some("2024/01/b.jpg".into()),
            ..Default::default()
        };
        fs::remove_file(src.join("2024/01/b.jpg")).unwrap();
        let (cur, _) = drain(&src, &dst, start, TimeBudget::unlimited);
        assert_eq!(cur.processed, 4);
        assert!(!dst.join("2024/01/a.jpg").exists());
        assert!(dst.join("z.txt").exists());
    }

    fn one_tick() -> TimeBudget {
        TimeBudget::start(Arc::new(TickClock::new(1.0)), 0.5)
    }

    #[test]
    fn half_copied_file_that_vanished_is_missing_resume_data() {
        let dir = tempfile::tempdir().unwrap();
        let (src, dst) = (dir.path().join("src"), dir.path().join("dst"));
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("big.mov"), vec![5u8; 2000]).unwrap();
        let c = ChunkedDirectoryCopier::new(policy(), ExcludeRules::default());

        let first = c.run(&src, &dst, &CopyCursor::default(), &one_tick()).unwrap();
        assert!(!first.done);
        assert_eq!(first.chunked_offset, Some(400));

        fs::remove_file(dst.join("big.mov")).unwrap();
        let err = c.run(&src, &dst, &first, &one_tick()).unwrap_err();
        assert!(matches!(err, SiteportError::MissingResumeData(_)));
        assert!(!dst.join("big.mov").exists());

        // a truncated partial is just as unusable
        fs::write(dst.join("big.mov"), vec![5u8; 100]).unwrap();
        let err = c.run(&src, &dst, &first, &one_tick()).unwrap_err();
        assert!(matches!(err, SiteportError::MissingResumeData(_)));
    }

    #[test]
    fn failed_file_is_retried_on_the_next_pass() {
        let dir = tempfile::tempdir().unwrap();
        let (src, dst) = (dir.path().join("src"), dir.path().join("dst"));
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), b"alpha").unwrap();
        fs::write(src.join("b.txt"), b"beta").unwrap();
        // a directory where a.txt should land makes its copy fail
        fs::create_dir_all(dst.join("a.txt")).unwrap();
        let c = ChunkedDirectoryCopier::new(policy(), ExcludeRules::default());

        let mut state = ProgressState::default();
        let first = c.run(&src, &dst, &CopyCursor::default(), &one_tick()).unwrap();
        assert!(!first.done);
        assert_eq!((first.processed, first.failed), (0, 1));
        assert_eq!(first.retry, vec!["a.txt".to_string()]);
        first.apply(&mut state);
        assert_eq!(state.copy.copydir_retry, Some(vec!["a.txt".to_string()]));

        fs::remove_dir(dst.join("a.txt")).unwrap();
        let mut calls = 1;
        let last = loop {
            let cur = c.run(&src, &dst, &CopyCursor::from_state(&state), &one_tick()).unwrap();
            calls += 1;
            assert!(calls < 10);
            if cur.done {
                break cur;
            }
            cur.apply(&mut state);
        };
        assert_eq!((last.processed, last.failed), (2, 0));
        assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(dst.join("b.txt")).unwrap(), b"beta");
    }

    #[test]
    fn unreadable_source_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = ChunkedDirectoryCopier::new(policy(), ExcludeRules::default())
            .run(&dir.path().join("missing"), &dir.path().join("dst"), &CopyCursor::default(), &TimeBudget::unlimited())
            .unwrap_err();
        assert!(matches!(err, SiteportError::DirOpen { .. }));
    }
}
