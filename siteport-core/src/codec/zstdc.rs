use super::{CodecId, FrameCodec};
use crate::error::{Result, SiteportError};

pub struct Zstd {
    pub level: i32,
}

impl FrameCodec for Zstd {
    fn id(&self) -> CodecId {
        CodecId::Zstd
    }

    fn encode(&self, plain: &[u8]) -> Result<Vec<u8>> {
        Ok(zstd::bulk::compress(plain, self.level.max(1))?)
    }

    // u_len is bounded by FrameHeader::validate before any frame reaches here
    fn decode(&self, payload: &[u8], u_len: u64) -> Result<Vec<u8>> {
        let cap = usize::try_from(u_len)
            .map_err(|_| SiteportError::Format(format!("frame length {u_len} too large")))?;
        let out = zstd::bulk::decompress(payload, cap)
            .map_err(|e| SiteportError::Format(format!("zstd frame: {e}")))?;
        if out.len() != cap {
            return Err(SiteportError::Format(format!(
                "frame decoded to {} bytes, expected {u_len}",
                out.len()
            )));
        }
        Ok(out)
    }
}
