use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use crate::batch::BatchPolicy;
use crate::budget::TimeBudget;
use crate::container::entry::EntryHeader;
use crate::error::{Result, SiteportError};
use crate::read::opened::Opened;
use crate::state::ProgressState;

/// Large file interrupted between frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MidEntry {
    pub index: u64,
    pub base_offset: u64,
    pub frame_offset: u64,
    pub written: u64,
}

/// Resume point read from the progress state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractResume {
    pub last_index: Option<u64>,
    pub bytes_offset: Option<u64>,
    pub batch_bytes: Option<u64>,
    pub extracted: u64,
    pub extracted_bytes: u64,
    pub failed: u64,
    pub mid_entry: Option<MidEntry>,
}

impl ExtractResume {
    pub fn from_state(s: &ProgressState) -> Self {
        let mid_entry = match (
            s.tar.tar_extract_index,
            s.tar.tar_extract_base_offset,
            s.tar.tar_extract_offset,
        ) {
            (Some(index), Some(base_offset), Some(frame_offset)) => Some(MidEntry {
                index,
                base_offset,
                frame_offset,
                written: s.tar.tar_extract_written.unwrap_or(0),
            }),
            _ => None,
        };
        Self {
            last_index: s.archive.media_zip_last_index,
            bytes_offset: s.archive.zip_bytes_offset,
            batch_bytes: s.archive.batch_bytes,
            extracted: s.archive.processed_file_count.unwrap_or(0),
            extracted_bytes: s.archive.archive_bytes_total.unwrap_or(0),
            failed: s.archive.archive_failed_count.unwrap_or(0),
            mid_entry,
        }
    }
}

/// Outcome of one extraction batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtractionCursor {
    pub done: bool,
    /// Entries consumed so far (index of the next entry).
    pub last_index: u64,
    /// Package offset of the next entry header.
    pub bytes_offset: u64,
    /// Entries in the package.
    pub total_files: u64,
    pub extracted: u64,
    pub extracted_bytes: u64,
    pub failed: u64,
    pub batch_bytes: u64,
    pub mid_entry: Option<MidEntry>,
    /// Last non-fatal entry failure of this batch.
    pub error: Option<String>,
}

impl ExtractionCursor {
    pub fn apply(&self, s: &mut ProgressState) {
        s.archive.media_zip_last_index = Some(self.last_index);
        s.archive.zip_bytes_offset = Some(self.bytes_offset);
        s.archive.total_numfiles_zip = Some(self.total_files);
        s.archive.processed_file_count = Some(self.extracted);
        s.archive.archive_bytes_total = Some(self.extracted_bytes);
        s.archive.archive_failed_count = Some(self.failed);
        s.archive.batch_bytes = Some(self.batch_bytes);
        s.archive.media_zip_extraction_done = Some(self.done);
        match self.mid_entry {
            Some(m) => {
                s.tar.tar_extract_index = Some(m.index);
                s.tar.tar_extract_base_offset = Some(m.base_offset);
                s.tar.tar_extract_offset = Some(m.frame_offset);
                s.tar.tar_extract_written = Some(m.written);
            }
            None => s.tar = Default::default(),
        }
    }
}

enum FileOutcome {
    Complete(u64),
    Failed { bytes: u64, reason: String },
    Suspended { mid: MidEntry, bytes: u64 },
}

pub struct ChunkedArchiveExtractor {
    policy: BatchPolicy,
}

impl ChunkedArchiveExtractor {
    pub fn new(policy: BatchPolicy) -> Self {
        Self { policy }
    }

    /// Extract entries until the budget, the byte threshold, or a large file
    /// ends the batch.
    pub fn run(
        &self,
        package: &Path,
        dest: &Path,
        resume: &ExtractResume,
        budget: &TimeBudget,
    ) -> Result<ExtractionCursor> {
        let mut pkg = Opened::open(package)?;
        fs::create_dir_all(dest)?;

        let threshold = self.policy.threshold(resume.batch_bytes);
        let mut cur = ExtractionCursor {
            last_index: resume.last_index.unwrap_or(0),
            total_files: pkg.tail.entry_count,
            extracted: resume.extracted,
            extracted_bytes: resume.extracted_bytes,
            failed: resume.failed,
            batch_bytes: threshold,
            ..Default::default()
        };
        let mut batch_bytes = 0u64;

        if let Some(mid) = resume.mid_entry {
            pkg.seek(mid.base_offset)?;
            let header = pkg
                .next_header()?
                .ok_or_else(|| SiteportError::MissingResumeData("mid-entry header".into()))?;
            pkg.seek(mid.frame_offset)?;
            debug!(path = %header.path, written = mid.written, "resuming large entry");
            let outcome = self.extract_file(&mut pkg, dest, &header, Some(mid), mid.written, budget)?;
            cur.mid_entry = self.settle(&mut cur, &header, outcome, &mut batch_bytes);
            cur.bytes_offset = match cur.mid_entry {
                Some(_) => mid.base_offset,
                None => pkg.position()?,
            };
            // a large file always gets its batch alone
            let elapsed = budget.check().elapsed;
            return Ok(self.finish(cur, batch_bytes, elapsed, budget, pkg.tail.entries_end));
        }

        match resume.bytes_offset {
            Some(off) => pkg.seek(off)?,
            None => {
                pkg.rewind()?;
                pkg.skip_entries(cur.last_index)?;
            }
        }

        let mut files_in_batch = 0u64;
        let mut elapsed = 0.0;
        loop {
            let entry_off = pkg.position()?;
            cur.bytes_offset = entry_off;
            let Some(header) = pkg.next_header()? else {
                break;
            };

            if header.is_dir() {
                match safe_join(dest, &header.path).and_then(|p| Ok(fs::create_dir_all(p)?)) {
                    Ok(()) => cur.extracted += 1,
                    Err(e) => {
                        warn!(path = %header.path, error = %e, "directory entry skipped");
                        cur.failed += 1;
                        cur.error = Some(format!("{}: {e}", header.path));
                    }
                }
                cur.last_index += 1;
                cur.bytes_offset = pkg.position()?;
                // directories add nothing to the byte threshold, only the clock counts
                let check = budget.check();
                elapsed = check.elapsed;
                if check.exceeded {
                    break;
                }
                continue;
            }

            let large = self.policy.is_large(header.size);
            if large && files_in_batch > 0 {
                debug!(path = %header.path, size = header.size, "large entry deferred to its own batch");
                elapsed = budget.check().elapsed;
                break;
            }
            let suspend = large.then_some(MidEntry {
                index: cur.last_index,
                base_offset: entry_off,
                frame_offset: 0,
                written: 0,
            });
            let outcome = self.extract_file(&mut pkg, dest, &header, suspend, 0, budget)?;
            files_in_batch += 1;
            cur.mid_entry = self.settle(&mut cur, &header, outcome, &mut batch_bytes);
            if cur.mid_entry.is_some() {
                elapsed = budget.check().elapsed;
                break;
            }
            if large {
                cur.bytes_offset = pkg.position()?;
                elapsed = budget.check().elapsed;
                break;
            }

            cur.bytes_offset = pkg.position()?;
            let check = budget.check();
            elapsed = check.elapsed;
            if check.exceeded || batch_bytes >= threshold {
                break;
            }
        }

        Ok(self.finish(cur, batch_bytes, elapsed, budget, pkg.tail.entries_end))
    }

    fn finish(
        &self,
        mut cur: ExtractionCursor,
        batch_bytes: u64,
        elapsed: f64,
        budget: &TimeBudget,
        entries_end: u64,
    ) -> ExtractionCursor {
        cur.batch_bytes =
            self.policy
                .next_batch_bytes(batch_bytes, elapsed, budget.timeout(), cur.batch_bytes);
        if cur.mid_entry.is_none() && cur.bytes_offset >= entries_end {
            cur.done = true;
            info!(
                entries = cur.total_files,
                extracted = cur.extracted,
                bytes = cur.extracted_bytes,
                failed = cur.failed,
                "package extraction complete"
            );
        } else {
            debug!(
                index = cur.last_index,
                offset = cur.bytes_offset,
                batch_bytes,
                "extraction batch ended"
            );
        }
        cur
    }

    /// Fold a file outcome into the cursor; returns the suspension point if any.
    fn settle(
        &self,
        cur: &mut ExtractionCursor,
        header: &EntryHeader,
        outcome: FileOutcome,
        batch_bytes: &mut u64,
    ) -> Option<MidEntry> {
        match outcome {
            FileOutcome::Complete(bytes) => {
                *batch_bytes += bytes;
                cur.extracted += 1;
                cur.extracted_bytes += header.size;
                cur.last_index += 1;
                None
            }
            FileOutcome::Failed { bytes, reason } => {
                *batch_bytes += bytes;
                warn!(path = %header.path, error = %reason, "file entry skipped");
                cur.failed += 1;
                cur.error = Some(format!("{}: {reason}", header.path));
                cur.last_index += 1;
                None
            }
            FileOutcome::Suspended { mid, bytes } => {
                *batch_bytes += bytes;
                Some(mid)
            }
        }
    }

    /// Stream the frames of one file entry into `dest`, starting `written`
    /// bytes in. With `suspend` set the file may stop between frames.
    fn extract_file(
        &self,
        pkg: &mut Opened,
        dest: &Path,
        header: &EntryHeader,
        suspend: Option<MidEntry>,
        mut written: u64,
        budget: &TimeBudget,
    ) -> Result<FileOutcome> {
        let start_written = written;
        let target = safe_join(dest, &header.path);
        let opened = target
            .as_ref()
            .map_err(|e| e.to_string())
            .and_then(|p| open_output(p, written).map_err(|e| e.to_string()));
        let mut out = match opened {
            Ok(f) => Some(f),
            Err(reason) if written > 0 => {
                return Err(SiteportError::MissingResumeData(format!(
                    "{}: {reason}",
                    header.path
                )));
            }
            Err(reason) => {
                pkg.skip_payload(header.size)?;
                return Ok(FileOutcome::Failed { bytes: 0, reason });
            }
        };

        let mut failure: Option<String> = None;
        while written < header.size {
            let frame = pkg.read_frame(header.size - written)?;
            written += frame.u_len;
            if let Some(f) = out.as_mut() {
                let res = frame.data.and_then(|plain| Ok(f.write_all(&plain)?));
                if let Err(e) = res {
                    failure = Some(e.to_string());
                    out = None;
                }
            }

            if let (Some(m), Some(f)) = (suspend, out.as_mut()) {
                if written < header.size && budget.check().exceeded {
                    f.flush()?;
                    return Ok(FileOutcome::Suspended {
                        mid: MidEntry {
                            frame_offset: pkg.position()?,
                            written,
                            ..m
                        },
                        bytes: written - start_written,
                    });
                }
            }
        }

        let bytes = written - start_written;
        match (failure, out, target) {
            (None, Some(mut f), Ok(p)) => {
                f.flush()?;
                drop(f);
                apply_mode(&p, header.mode);
                Ok(FileOutcome::Complete(bytes))
            }
            (reason, _, target) => {
                if let Ok(p) = target {
                    let _ = fs::remove_file(p);
                }
                Ok(FileOutcome::Failed {
                    bytes,
                    reason: reason.unwrap_or_else(|| "output lost".into()),
                })
            }
        }
    }
}

fn open_output(path: &Path, written: u64) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    if written == 0 {
        return Ok(File::create(path)?);
    }
    let missing = |why: String| SiteportError::MissingResumeData(format!("{}: {why}", path.display()));
    let mut f = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| missing(e.to_string()))?;
    let have = f.metadata()?.len();
    if have < written {
        return Err(missing(format!("holds {have} bytes, {written} already written")));
    }
    f.set_len(written)?;
    f.seek(SeekFrom::End(0))?;
    Ok(f)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777)) {
            warn!(path = %path.display(), mode = mode & 0o777, error = %e, "mode not applied");
        }
    }
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) {}

/// Join an archive path under `root`, refusing anything that could escape it.
pub fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);
    let clean = !rel.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !clean || rel.contains('\\') {
        return Err(SiteportError::Format(format!("unsafe path: {rel}")));
    }
    Ok(root.join(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::TickClock;
    use crate::container::entry::EntryKind;
    use crate::container::meta::PackageMeta;
    use crate::pack::writer::PackageFile;
    use std::sync::Arc;

    fn policy() -> BatchPolicy {
        BatchPolicy {
            large_file_bytes: 1000,
            first_run_batch_bytes: 1 << 20,
            min_batch_bytes: 1 << 20,
            frame_bytes: 256,
        }
    }

    fn package(dir: &Path, entries: &[(&str, Option<Vec<u8>>)]) -> PathBuf {
        let p = dir.join("site.spkg");
        let mut pkg = PackageFile::create(&p, &PackageMeta::default()).unwrap();
        for (path, data) in entries {
            match data {
                None => pkg.write_dir(path, 0o755, 0).unwrap(),
                Some(d) => {
                    pkg.write_header(&EntryHeader {
                        path: path.to_string(),
                        kind: EntryKind::File,
                        size: d.len() as u64,
                        mode: 0o644,
                        mtime: 0,
                    })
                    .unwrap();
                    for c in d.chunks(256) {
                        pkg.write_frame(c).unwrap();
                    }
                    pkg.end_file(d.len() as u64);
                }
            }
        }
        pkg.finish().unwrap();
        p
    }

    fn big() -> Vec<u8> {
        (0..3000u32).map(|i| (i * 7 % 251) as u8).collect()
    }

    /// Drive the extractor to completion through the progress state.
    fn drain(pkg: &Path, dest: &Path, budget: impl Fn() -> TimeBudget) -> (ExtractionCursor, u32) {
        let x = ChunkedArchiveExtractor::new(policy());
        let mut state = ProgressState::default();
        let mut calls = 0;
        loop {
            let resume = ExtractResume::from_state(&state);
            let cur = x.run(pkg, dest, &resume, &budget()).unwrap();
            cur.apply(&mut state);
            calls += 1;
            assert!(calls < 1000, "extraction does not terminate");
            if cur.done {
                return (cur, calls);
            }
        }
    }

    #[test]
    fn empty_package_is_done_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package(dir.path(), &[]);
        let (cur, calls) = drain(&pkg, &dir.path().join("out"), TimeBudget::unlimited);
        assert_eq!(calls, 1);
        assert_eq!(cur.total_files, 0);
        assert_eq!(cur.extracted, 0);
    }

    #[test]
    fn large_file_gets_a_batch_of_its_own() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package(
            dir.path(),
            &[
                ("a.txt", Some(b"aaa".to_vec())),
                ("big.bin", Some(big())),
                ("c.txt", Some(b"ccc".to_vec())),
            ],
        );
        let dest = dir.path().join("out");
        let x = ChunkedArchiveExtractor::new(policy());

        let first = x
            .run(&pkg, &dest, &ExtractResume::default(), &TimeBudget::unlimited())
            .unwrap();
        assert!(!first.done);
        assert_eq!(first.last_index, 1);
        assert!(!dest.join("big.bin").exists());

        let mut state = ProgressState::default();
        first.apply(&mut state);
        let second = x
            .run(&pkg, &dest, &ExtractResume::from_state(&state), &TimeBudget::unlimited())
            .unwrap();
        assert_eq!(second.last_index, 2);
        assert_eq!(second.extracted, 2);
        assert!(!dest.join("c.txt").exists());

        second.apply(&mut state);
        let third = x
            .run(&pkg, &dest, &ExtractResume::from_state(&state), &TimeBudget::unlimited())
            .unwrap();
        assert!(third.done);
        assert_eq!(third.extracted, 3);
        assert_eq!(fs::read(dest.join("big.bin")).unwrap(), big());
    }

    #[test]
    fn large_file_resumes_between_frames() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package(
            dir.path(),
            &[
                ("a.txt", Some(b"aaa".to_vec())),
                ("big.bin", Some(big())),
                ("z", None),
            ],
        );
        let dest = dir.path().join("out");
        // every check after the start is over budget
        let (cur, calls) = drain(&pkg, &dest, || {
            TimeBudget::start(Arc::new(TickClock::new(1.0)), 0.5)
        });
        // a.txt, 12 frames of big.bin, then the directory
        assert_eq!(calls, 1 + 12 + 1);
        assert_eq!(cur.extracted, 3);
        assert_eq!(cur.extracted_bytes, 3 + 3000);
        assert_eq!(fs::read(dest.join("big.bin")).unwrap(), big());
        assert!(dest.join("z").is_dir());
    }

    #[test]
    fn directory_entries_respect_the_budget() {
        let dir = tempfile::tempdir().unwrap();
        let names: Vec<String> = (0..500).map(|i| format!("d{i:03}")).collect();
        let entries: Vec<(&str, Option<Vec<u8>>)> = names.iter().map(|n| (n.as_str(), None)).collect();
        let pkg = package(dir.path(), &entries);
        let dest = dir.path().join("out");
        let spent = || TimeBudget::start(Arc::new(TickClock::new(1.0)), 0.5);

        let first = ChunkedArchiveExtractor::new(policy())
            .run(&pkg, &dest, &ExtractResume::default(), &spent())
            .unwrap();
        assert!(!first.done);
        assert_eq!((first.extracted, first.last_index), (1, 1));

        let (cur, calls) = drain(&pkg, &dest, spent);
        assert_eq!(calls, 500);
        assert_eq!(cur.extracted, 500);
        assert!(dest.join("d499").is_dir());
    }

    #[test]
    fn partial_output_shorter_than_recorded_is_missing_resume_data() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("big.bin");
        fs::write(&out, vec![1u8; 100]).unwrap();
        assert!(matches!(open_output(&out, 512), Err(SiteportError::MissingResumeData(_))));
        assert!(matches!(
            open_output(&dir.path().join("gone.bin"), 512),
            Err(SiteportError::MissingResumeData(_))
        ));
        let f = open_output(&out, 40).unwrap();
        assert_eq!(f.metadata().unwrap().len(), 40);
    }

    #[test]
    fn unappliable_mode_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("never-written");
        apply_mode(&gone, 0o644);
        assert!(!gone.exists());
    }

    #[test]
    fn escaping_paths_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = package(
            dir.path(),
            &[
                ("../evil.txt", Some(b"x".to_vec())),
                ("/abs.txt", Some(b"y".to_vec())),
                ("ok.txt", Some(b"fine".to_vec())),
            ],
        );
        let dest = dir.path().join("out");
        let (cur, _) = drain(&pkg, &dest, TimeBudget::unlimited);
        assert_eq!(cur.failed, 2);
        assert_eq!(cur.extracted, 1);
        assert!(cur.error.is_some());
        assert!(!dir.path().join("evil.txt").exists());
        assert_eq!(fs::read(dest.join("ok.txt")).unwrap(), b"fine");
    }

    #[test]
    fn package_without_tail_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("partial.spkg");
        let mut pkg = PackageFile::create(&p, &PackageMeta::default()).unwrap();
        pkg.write_dir("media", 0o755, 0).unwrap();
        pkg.sync().unwrap();
        let err = ChunkedArchiveExtractor::new(policy())
            .run(&p, dir.path(), &ExtractResume::default(), &TimeBudget::unlimited())
            .unwrap_err();
        assert!(matches!(err, SiteportError::ArchiveOpen { .. }));
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let root = Path::new("/srv/stage");
        assert!(safe_join(root, "media/a.jpg").is_ok());
        assert!(safe_join(root, "./media").is_ok());
        assert!(safe_join(root, "../x").is_err());
        assert!(safe_join(root, "a/../../x").is_err());
        assert!(safe_join(root, "/etc/passwd").is_err());
        assert!(safe_join(root, "a\\..\\b").is_err());
        assert!(safe_join(root, "").is_err());
    }
}
