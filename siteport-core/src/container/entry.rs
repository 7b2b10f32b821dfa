use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::codec::CodecId;
use crate::error::{Result, SiteportError};
use crate::util::varint::{get_uvarint, put_uvarint};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Entry record; a file entry is followed by frames whose `u_len` sum to `size`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
}

impl EntryHeader {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    /// `[uvarint len][cbor]`
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut cbor = Vec::with_capacity(64);
        ciborium::ser::into_writer(self, &mut cbor)
            .map_err(|e| SiteportError::Format(format!("entry encode: {e}")))?;
        let mut out = Vec::with_capacity(cbor.len() + 4);
        put_uvarint(&mut out, cbor.len() as u64);
        out.extend_from_slice(&cbor);
        Ok(out)
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Option<Self>> {
        let Some(len) = get_uvarint(r)? else {
            return Ok(None);
        };
        if len > 64 * 1024 {
            return Err(SiteportError::Format(format!("entry header too long: {len}")));
        }
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf)?;
        let h = ciborium::de::from_reader(&buf[..])
            .map_err(|e| SiteportError::Format(format!("entry decode: {e}")))?;
        Ok(Some(h))
    }
}

/// Largest plaintext a single frame may carry.
pub const MAX_FRAME_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub codec: CodecId,
    pub u_len: u64,
    pub c_len: u64,
    pub blake3: [u8; 32],
}

impl FrameHeader {
    pub fn write_to<W: Write>(&self, mut w: W) -> std::io::Result<u64> {
        let mut out = Vec::with_capacity(1 + 20 + 32);
        out.push(self.codec as u8);
        put_uvarint(&mut out, self.u_len);
        put_uvarint(&mut out, self.c_len);
        out.extend_from_slice(&self.blake3);
        w.write_all(&out)?;
        Ok(out.len() as u64)
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut codec = [0u8; 1];
        r.read_exact(&mut codec)?;
        let codec = CodecId::try_from(codec[0])?;
        let u_len = get_uvarint(r)?
            .ok_or_else(|| SiteportError::Format("truncated frame header".into()))?;
        let c_len = get_uvarint(r)?
            .ok_or_else(|| SiteportError::Format("truncated frame header".into()))?;
        let mut blake3 = [0u8; 32];
        r.read_exact(&mut blake3)?;
        Ok(Self {
            codec,
            u_len,
            c_len,
            blake3,
        })
    }

    /// Lengths come from the package; nothing is allocated before this passes.
    /// A zstd payload is only ever kept when smaller, so `c_len <= u_len`.
    pub fn validate(&self, entry_left: u64, region_left: u64) -> Result<()> {
        if self.u_len == 0 || self.u_len > entry_left || self.u_len > MAX_FRAME_BYTES {
            return Err(SiteportError::Format(format!(
                "frame length {} out of range ({entry_left} left in entry)",
                self.u_len
            )));
        }
        if self.c_len > self.u_len || self.c_len > region_left {
            return Err(SiteportError::Format(format!(
                "frame payload of {} bytes overruns the entry region",
                self.c_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(u_len: u64, c_len: u64) -> FrameHeader {
        FrameHeader {
            codec: CodecId::Zstd,
            u_len,
            c_len,
            blake3: [0; 32],
        }
    }

    #[test]
    fn frame_lengths_are_bounded() {
        assert!(frame(100, 80).validate(100, 1000).is_ok());
        assert!(frame(0, 0).validate(100, 1000).is_err());
        assert!(frame(101, 80).validate(100, 1000).is_err());
        assert!(frame(100, 101).validate(100, 1000).is_err());
        assert!(frame(100, 80).validate(100, 79).is_err());
        assert!(frame(1 << 62, 1 << 62).validate(u64::MAX, u64::MAX).is_err());
    }

    #[test]
    fn header_decode_consumes_exactly_its_bytes() {
        let h = EntryHeader {
            path: "media/2024/01/a.jpg".into(),
            kind: EntryKind::File,
            size: 5,
            mode: 0o644,
            mtime: 0,
        };
        let mut bytes = h.encode().unwrap();
        bytes.extend_from_slice(b"rest");
        let mut r = &bytes[..];
        assert_eq!(EntryHeader::decode(&mut r).unwrap(), Some(h));
        assert_eq!(r, b"rest");
        assert_eq!(EntryHeader::decode(&mut &[][..]).unwrap(), None);
    }
}
