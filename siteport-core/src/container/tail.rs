use std::io::{Read, Seek, SeekFrom, Write};

pub const TAIL_MAGIC: [u8; 8] = *b"SPKGTAIL";
pub const TAIL_LEN: u64 = 8 + 8 + 8 + 8;

/// Written once the last entry is committed; a package without it is incomplete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TailSummary {
    pub entry_count: u64,
    pub total_u: u64,
    /// Offset just past the last entry (== start of the tail).
    pub entries_end: u64,
}

impl TailSummary {
    pub fn write_to<W: Write>(self, mut w: W) -> std::io::Result<()> {
        w.write_all(&TAIL_MAGIC)?;
        w.write_all(&self.entry_count.to_le_bytes())?;
        w.write_all(&self.total_u.to_le_bytes())?;
        w.write_all(&self.entries_end.to_le_bytes())?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut r: R) -> std::io::Result<Self> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if magic != TAIL_MAGIC {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad tail magic (incomplete package?)",
            ));
        }
        let mut buf8 = [0u8; 8];
        let mut t = TailSummary::default();
        r.read_exact(&mut buf8)?;
        t.entry_count = u64::from_le_bytes(buf8);
        r.read_exact(&mut buf8)?;
        t.total_u = u64::from_le_bytes(buf8);
        r.read_exact(&mut buf8)?;
        t.entries_end = u64::from_le_bytes(buf8);
        Ok(t)
    }
}

/// Locate the tail in the last `TAIL_LEN` bytes of the file.
pub fn read_tail_at_eof<F: Read + Seek>(f: &mut F) -> std::io::Result<TailSummary> {
    let len = f.seek(SeekFrom::End(0))?;
    if len < TAIL_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "file too small for tail",
        ));
    }
    f.seek(SeekFrom::End(-(TAIL_LEN as i64)))?;
    let t = TailSummary::read_from(&mut *f)?;
    if t.entries_end != len - TAIL_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "tail does not match file length",
        ));
    }
    Ok(t)
}
