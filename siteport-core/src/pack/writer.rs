use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::batch::BatchPolicy;
use crate::budget::TimeBudget;
use crate::codec::encode_frame;
use crate::container::entry::{EntryHeader, EntryKind, FrameHeader, MAX_FRAME_BYTES};
use crate::container::meta::PackageMeta;
use crate::container::superblock::{Superblock, VERSION};
use crate::container::tail::TailSummary;
use crate::error::{Result, SiteportError};
use crate::pack::walker::{FileListReader, ListItem};
use crate::state::ProgressState;

/// Package bytes that are safe to keep when the writer is re-opened.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Committed {
    pub len: u64,
    pub entry_count: u64,
    pub total_u: u64,
}

/// Append-only package under construction.
pub struct PackageFile {
    path: PathBuf,
    w: BufWriter<File>,
    committed: Committed,
}

impl PackageFile {
    /// Create (or replace) a package and write its header and meta.
    pub fn create(path: &Path, meta: &PackageMeta) -> Result<Self> {
        let open_err = |e: std::io::Error| SiteportError::ArchiveOpen {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(open_err)?;
        }
        let f = File::create(path).map_err(open_err)?;
        let mut w = BufWriter::new(f);

        let mut mbytes = Vec::new();
        ciborium::ser::into_writer(meta, &mut mbytes)
            .map_err(|e| SiteportError::Format(format!("meta encode: {e}")))?;
        let sb = Superblock {
            version: VERSION,
            flags: 0,
            meta_len: mbytes.len() as u64,
        };
        sb.write_to(&mut w)?;
        w.write_all(&mbytes)?;
        Ok(Self {
            path: path.to_path_buf(),
            w,
            committed: Committed {
                len: sb.entries_off(),
                entry_count: 0,
                total_u: 0,
            },
        })
    }

    /// Re-open a partially written package, dropping anything past `committed.len`.
    pub fn open_at(path: &Path, committed: Committed) -> Result<Self> {
        let mut f = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| SiteportError::MissingResumeData(format!("{}: {e}", path.display())))?;
        let len = f.metadata()?.len();
        if len < committed.len {
            return Err(SiteportError::MissingResumeData(format!(
                "{}: {len} bytes on disk, {} committed",
                path.display(),
                committed.len
            )));
        }
        f.set_len(committed.len)?;
        f.seek(SeekFrom::End(0))?;
        Ok(Self {
            path: path.to_path_buf(),
            w: BufWriter::new(f),
            committed,
        })
    }

    pub fn committed(&self) -> Committed {
        self.committed
    }

    pub fn len(&self) -> u64 {
        self.committed.len
    }

    /// Drop bytes written since `len` (a failed entry).
    pub fn rollback_to(&mut self, len: u64) -> Result<()> {
        self.w.flush()?;
        let f = self.w.get_mut();
        f.set_len(len)?;
        f.seek(SeekFrom::End(0))?;
        self.committed.len = len;
        Ok(())
    }

    pub fn write_dir(&mut self, rel: &str, mode: u32, mtime: i64) -> Result<()> {
        let h = EntryHeader {
            path: rel.to_string(),
            kind: EntryKind::Dir,
            size: 0,
            mode,
            mtime,
        };
        self.write_header(&h)?;
        self.committed.entry_count += 1;
        Ok(())
    }

    /// Header of a file entry; frames follow, then `end_file`.
    pub fn write_header(&mut self, h: &EntryHeader) -> Result<()> {
        let bytes = h.encode()?;
        self.w.write_all(&bytes)?;
        self.committed.len += bytes.len() as u64;
        Ok(())
    }

    pub fn write_frame(&mut self, plain: &[u8]) -> Result<()> {
        if plain.is_empty() || plain.len() as u64 > MAX_FRAME_BYTES {
            return Err(SiteportError::Format(format!(
                "frame of {} bytes out of range",
                plain.len()
            )));
        }
        let (codec, payload) = encode_frame(plain)?;
        let fh = FrameHeader {
            codec,
            u_len: plain.len() as u64,
            c_len: payload.len() as u64,
            blake3: *blake3::hash(plain).as_bytes(),
        };
        let n = fh.write_to(&mut self.w)?;
        self.w.write_all(&payload)?;
        self.committed.len += n + payload.len() as u64;
        Ok(())
    }

    pub fn end_file(&mut self, size: u64) {
        self.committed.entry_count += 1;
        self.committed.total_u += size;
    }

    /// Flush and fsync; everything up to `len()` is durable afterwards.
    pub fn sync(&mut self) -> Result<()> {
        self.w.flush()?;
        self.w.get_ref().sync_data()?;
        Ok(())
    }

    /// Seal the package with its tail.
    pub fn finish(mut self) -> Result<TailSummary> {
        let tail = TailSummary {
            entry_count: self.committed.entry_count,
            total_u: self.committed.total_u,
            entries_end: self.committed.len,
        };
        tail.write_to(&mut self.w)?;
        self.sync()?;
        Ok(tail)
    }
}

/// Resume point of the writer, read from the progress state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteResume {
    pub list_offset: u64,
    pub committed: Option<Committed>,
    pub batch_bytes: Option<u64>,
    pub failed: u64,
    /// Source bytes of the current large file already framed.
    pub source_offset: Option<u64>,
    pub entry_offset: Option<u64>,
}

impl WriteResume {
    pub fn from_state(s: &ProgressState) -> Self {
        let a = &s.archive;
        let committed = a.zip_bytes_offset.map(|len| Committed {
            len,
            entry_count: a.processed_file_count.unwrap_or(0),
            total_u: a.archive_bytes_total.unwrap_or(0),
        });
        Self {
            list_offset: a.file_reading_position.unwrap_or(0),
            committed,
            batch_bytes: a.batch_bytes,
            failed: a.archive_failed_count.unwrap_or(0),
            source_offset: a.archive_source_offset,
            entry_offset: a.archive_entry_offset,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteCursor {
    pub done: bool,
    /// Offset of the next unprocessed list line.
    pub list_offset: u64,
    pub committed: Committed,
    pub failed: u64,
    pub batch_bytes: u64,
    pub source_offset: Option<u64>,
    pub entry_offset: Option<u64>,
    pub error: Option<String>,
}

impl WriteCursor {
    pub fn apply(&self, s: &mut ProgressState) {
        let a = &mut s.archive;
        a.file_reading_position = Some(self.list_offset);
        a.zip_bytes_offset = Some(self.committed.len);
        a.processed_file_count = Some(self.committed.entry_count);
        a.archive_bytes_total = Some(self.committed.total_u);
        a.archive_failed_count = Some(self.failed);
        a.batch_bytes = Some(self.batch_bytes);
        a.archive_source_offset = self.source_offset;
        a.archive_entry_offset = self.entry_offset;
    }
}

enum AddOutcome {
    Added(u64),
    Failed { bytes: u64, reason: String },
    Suspended { source_offset: u64, bytes: u64 },
}

/// Streams files named by a list into a package in bounded batches.
pub struct ArchiveWriter {
    policy: BatchPolicy,
}

impl ArchiveWriter {
    pub fn new(policy: BatchPolicy) -> Self {
        Self { policy }
    }

    pub fn run(
        &self,
        package: &Path,
        root: &Path,
        list: &Path,
        meta: &PackageMeta,
        resume: &WriteResume,
        budget: &TimeBudget,
    ) -> Result<WriteCursor> {
        let mut pkg = match resume.committed {
            Some(c) => PackageFile::open_at(package, c)?,
            None => PackageFile::create(package, meta)?,
        };
        let mut items = FileListReader::open(list, resume.list_offset)?;
        let threshold = self.policy.threshold(resume.batch_bytes);
        let mut cur = WriteCursor {
            list_offset: resume.list_offset,
            failed: resume.failed,
            batch_bytes: threshold,
            ..Default::default()
        };
        let mut batch_bytes = 0u64;

        if let (Some(source_offset), Some(entry_offset)) = (resume.source_offset, resume.entry_offset) {
            let item = items
                .next_item()?
                .ok_or_else(|| SiteportError::MissingResumeData("file under archive".into()))?;
            debug!(path = %item.rel, source_offset, "resuming large file");
            let outcome = self.add_file(&mut pkg, root, &item, source_offset, entry_offset, true, budget)?;
            self.settle(&mut cur, &mut pkg, &item, outcome, entry_offset, &mut batch_bytes);
            if cur.source_offset.is_none() {
                cur.list_offset = items.position();
            }
            return self.finish(pkg, cur, batch_bytes, budget, &mut items);
        }

        let mut files_in_batch = 0u64;
        loop {
            let line_start = items.position();
            cur.list_offset = line_start;
            let Some(item) = items.next_item()? else {
                break;
            };

            if item.is_dir {
                let (mode, mtime) = match fs::metadata(root.join(&item.rel)) {
                    Ok(md) => (mode_of(&md), mtime_of(&md)),
                    Err(_) => (0o755, 0),
                };
                pkg.write_dir(&item.rel, mode, mtime)?;
            } else {
                let size = fs::metadata(root.join(&item.rel)).map(|m| m.len()).unwrap_or(0);
                let large = self.policy.is_large(size);
                if large && files_in_batch > 0 {
                    debug!(path = %item.rel, size, "large file deferred to its own batch");
                    break;
                }
                let entry_offset = pkg.len();
                let outcome = self.add_file(&mut pkg, root, &item, 0, entry_offset, large, budget)?;
                files_in_batch += 1;
                self.settle(&mut cur, &mut pkg, &item, outcome, entry_offset, &mut batch_bytes);
                if cur.source_offset.is_some() {
                    break;
                }
                if large {
                    cur.list_offset = items.position();
                    break;
                }
            }

            cur.list_offset = items.position();
            if budget.exceeded() || batch_bytes >= threshold {
                break;
            }
        }

        self.finish(pkg, cur, batch_bytes, budget, &mut items)
    }

    fn finish(
        &self,
        mut pkg: PackageFile,
        mut cur: WriteCursor,
        batch_bytes: u64,
        budget: &TimeBudget,
        items: &mut FileListReader,
    ) -> Result<WriteCursor> {
        let elapsed = budget.check().elapsed;
        cur.batch_bytes =
            self.policy
                .next_batch_bytes(batch_bytes, elapsed, budget.timeout(), cur.batch_bytes);

        let exhausted = cur.source_offset.is_none()
            && cur.list_offset == items.position()
            && items.next_item()?.is_none();
        cur.committed = pkg.committed();
        if exhausted {
            let tail = pkg.finish()?;
            cur.done = true;
            info!(
                entries = tail.entry_count,
                bytes = tail.total_u,
                failed = cur.failed,
                "package written"
            );
        } else {
            pkg.sync()?;
            debug!(
                list_offset = cur.list_offset,
                package_len = cur.committed.len,
                batch_bytes,
                "archive batch ended"
            );
        }
        Ok(cur)
    }

    fn settle(
        &self,
        cur: &mut WriteCursor,
        pkg: &mut PackageFile,
        item: &ListItem,
        outcome: AddOutcome,
        entry_offset: u64,
        batch_bytes: &mut u64,
    ) {
        cur.source_offset = None;
        cur.entry_offset = None;
        match outcome {
            AddOutcome::Added(bytes) => *batch_bytes += bytes,
            AddOutcome::Failed { bytes, reason } => {
                *batch_bytes += bytes;
                warn!(path = %item.rel, error = %reason, "file not archived");
                cur.failed += 1;
                cur.error = Some(format!("{}: {reason}", item.rel));
                if let Err(e) = pkg.rollback_to(entry_offset) {
                    warn!(error = %e, "rollback of failed entry");
                }
            }
            AddOutcome::Suspended {
                source_offset,
                bytes,
            } => {
                *batch_bytes += bytes;
                cur.source_offset = Some(source_offset);
                cur.entry_offset = Some(entry_offset);
            }
        }
    }

    /// Frame one file starting at `source_offset`. The header is written only
    /// on a fresh start.
    #[allow(clippy::too_many_arguments)]
    fn add_file(
        &self,
        pkg: &mut PackageFile,
        root: &Path,
        item: &ListItem,
        source_offset: u64,
        entry_offset: u64,
        suspendable: bool,
        budget: &TimeBudget,
    ) -> Result<AddOutcome> {
        let path: PathBuf = root.join(&item.rel);
        let opened = File::open(&path).and_then(|f| {
            let md = f.metadata()?;
            Ok((f, md))
        });
        let (mut f, md) = match opened {
            Ok(v) => v,
            Err(e) => {
                return Ok(AddOutcome::Failed {
                    bytes: 0,
                    reason: e.to_string(),
                });
            }
        };

        let size = if source_offset == 0 {
            let h = EntryHeader {
                path: item.rel.clone(),
                kind: EntryKind::File,
                size: md.len(),
                mode: mode_of(&md),
                mtime: mtime_of(&md),
            };
            pkg.write_header(&h)?;
            md.len()
        } else {
            entry_size_at(pkg, entry_offset)?
        };

        if let Err(e) = f.seek(SeekFrom::Start(source_offset)) {
            return Ok(AddOutcome::Failed {
                bytes: 0,
                reason: e.to_string(),
            });
        }
        let mut done = source_offset;
        let mut buf = vec![0u8; self.policy.frame_bytes.min(size.max(1)) as usize];
        while done < size {
            let want = (size - done).min(buf.len() as u64) as usize;
            if let Err(e) = f.read_exact(&mut buf[..want]) {
                return Ok(AddOutcome::Failed {
                    bytes: done - source_offset,
                    reason: e.to_string(),
                });
            }
            pkg.write_frame(&buf[..want])?;
            done += want as u64;

            if suspendable && done < size && budget.exceeded() {
                return Ok(AddOutcome::Suspended {
                    source_offset: done,
                    bytes: done - source_offset,
                });
            }
        }
        pkg.end_file(size);
        Ok(AddOutcome::Added(done - source_offset))
    }
}

/// Size recorded in the entry header at `entry_offset` of the package being written.
fn entry_size_at(pkg: &mut PackageFile, entry_offset: u64) -> Result<u64> {
    pkg.w.flush()?;
    let mut rd = File::open(&pkg.path)?;
    rd.seek(SeekFrom::Start(entry_offset))?;
    let h = EntryHeader::decode(&mut rd)?.ok_or_else(|| {
        SiteportError::MissingResumeData("entry header of file under archive".into())
    })?;
    Ok(h.size)
}

fn mode_of(md: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        md.permissions().mode() & 0o777
    }
    #[cfg(not(unix))]
    {
        if md.is_dir() { 0o755 } else { 0o644 }
    }
}

fn mtime_of(md: &fs::Metadata) -> i64 {
    md.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
