use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::codec::decode_frame;
use crate::container::entry::{EntryHeader, FrameHeader};
use crate::container::meta::PackageMeta;
use crate::container::superblock::{HEADER_LEN, Superblock};
use crate::container::tail::{TailSummary, read_tail_at_eof};
use crate::error::{Result, SiteportError};

pub struct Frame {
    pub u_len: u64,
    pub data: Result<Vec<u8>>,
}

/// A complete package opened for sequential entry reads.
///
/// Entry order is the on-disk order, so re-opening and skipping `n` entries
/// lands on the same entry as seeking to a saved offset.
pub struct Opened {
    f: BufReader<File>,
    pub sb: Superblock,
    pub meta: PackageMeta,
    pub tail: TailSummary,
}

impl Opened {
    pub fn open(path: &Path) -> Result<Self> {
        let open_err = |reason: String| SiteportError::ArchiveOpen {
            path: path.display().to_string(),
            reason,
        };
        let mut f = File::open(path).map_err(|e| open_err(e.to_string()))?;
        let sb = Superblock::read_from(&mut f).map_err(|e| open_err(e.to_string()))?;
        let tail = read_tail_at_eof(&mut f).map_err(|e| open_err(e.to_string()))?;
        if tail.entries_end < sb.entries_off() {
            return Err(open_err("meta overlaps tail".into()));
        }

        f.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut mbytes = vec![0u8; sb.meta_len as usize];
        f.read_exact(&mut mbytes)
            .map_err(|e| open_err(format!("meta: {e}")))?;
        let meta: PackageMeta = ciborium::de::from_reader(&mbytes[..])
            .map_err(|e| open_err(format!("meta decode: {e}")))?;

        Ok(Self {
            f: BufReader::new(f),
            sb,
            meta,
            tail,
        })
    }

    pub fn entries_off(&self) -> u64 {
        self.sb.entries_off()
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.f.stream_position()?)
    }

    pub fn seek(&mut self, off: u64) -> Result<()> {
        if off < self.entries_off() || off > self.tail.entries_end {
            return Err(SiteportError::Format(format!(
                "offset {off} outside entry region"
            )));
        }
        self.f.seek(SeekFrom::Start(off))?;
        Ok(())
    }

    pub fn rewind(&mut self) -> Result<()> {
        let off = self.entries_off();
        self.seek(off)
    }

    /// Next entry header, or `None` at the end of the entry region.
    pub fn next_header(&mut self) -> Result<Option<EntryHeader>> {
        if self.position()? >= self.tail.entries_end {
            return Ok(None);
        }
        match EntryHeader::decode(&mut self.f)? {
            Some(h) => Ok(Some(h)),
            None => Err(SiteportError::Format("entry region ends early".into())),
        }
    }

    fn next_frame_header(&mut self, entry_left: u64) -> Result<FrameHeader> {
        let fh = FrameHeader::read_from(&mut self.f)?;
        let region_left = self.tail.entries_end.saturating_sub(self.position()?);
        fh.validate(entry_left, region_left)?;
        Ok(fh)
    }

    /// Read one frame of an entry with `entry_left` bytes still to come.
    /// The outer error means the stream is unusable; a bad payload only
    /// fails `Frame::data` and leaves the reader aligned.
    pub fn read_frame(&mut self, entry_left: u64) -> Result<Frame> {
        let fh = self.next_frame_header(entry_left)?;
        let mut payload = vec![0u8; fh.c_len as usize];
        self.f.read_exact(&mut payload)?;
        let data = decode_frame(fh.codec, &payload, fh.u_len).and_then(|plain| {
            if blake3::hash(&plain).as_bytes() != &fh.blake3 {
                return Err(SiteportError::Format("frame checksum mismatch".into()));
            }
            Ok(plain)
        });
        Ok(Frame {
            u_len: fh.u_len,
            data,
        })
    }

    /// Skip the frames of a file entry without decoding them.
    pub fn skip_payload(&mut self, mut remaining: u64) -> Result<()> {
        while remaining > 0 {
            let fh = self.next_frame_header(remaining)?;
            self.f.seek_relative(fh.c_len as i64)?;
            remaining -= fh.u_len;
        }
        Ok(())
    }

    /// Skip whole entries from the current position.
    pub fn skip_entries(&mut self, n: u64) -> Result<()> {
        for _ in 0..n {
            let h = self
                .next_header()?
                .ok_or_else(|| SiteportError::Format("resume index past end".into()))?;
            if !h.is_dir() {
                self.skip_payload(h.size)?;
            }
        }
        Ok(())
    }
}
