use super::{CodecId, FrameCodec};
use crate::error::{Result, SiteportError};

/// Frames kept as-is when compression does not pay off.
pub struct Store;

impl FrameCodec for Store {
    fn id(&self) -> CodecId {
        CodecId::Store
    }

    fn encode(&self, plain: &[u8]) -> Result<Vec<u8>> {
        Ok(plain.to_vec())
    }

    fn decode(&self, payload: &[u8], u_len: u64) -> Result<Vec<u8>> {
        if payload.len() as u64 != u_len {
            return Err(SiteportError::Format(format!(
                "stored frame holds {} bytes, header says {u_len}",
                payload.len()
            )));
        }
        Ok(payload.to_vec())
    }
}
