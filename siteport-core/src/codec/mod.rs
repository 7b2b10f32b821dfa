use crate::error::{Result, SiteportError};

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CodecId {
    Store = 0,
    Zstd = 1,
}

impl TryFrom<u8> for CodecId {
    type Error = SiteportError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(CodecId::Store),
            1 => Ok(CodecId::Zstd),
            other => Err(SiteportError::Format(format!("unknown codec id {other}"))),
        }
    }
}

/// Turns one in-memory frame into its on-disk payload and back.
pub trait FrameCodec: Send + Sync {
    fn id(&self) -> CodecId;
    fn encode(&self, plain: &[u8]) -> Result<Vec<u8>>;
    fn decode(&self, payload: &[u8], u_len: u64) -> Result<Vec<u8>>;
}

pub mod store;
pub mod zstdc;

/// Only accept compression that saves at least this fraction.
pub const MIN_GAIN: f64 = 0.05;

static ZSTD: zstdc::Zstd = zstdc::Zstd { level: 3 };

fn pays_off(u: usize, c: usize) -> bool {
    (u as f64 - c as f64) >= u as f64 * MIN_GAIN
}

fn codec_for(id: CodecId) -> &'static dyn FrameCodec {
    match id {
        CodecId::Store => &store::Store,
        CodecId::Zstd => &ZSTD,
    }
}

/// Encode one frame payload, falling back to STORE when zstd does not pay off.
pub fn encode_frame(plain: &[u8]) -> Result<(CodecId, Vec<u8>)> {
    let z = codec_for(CodecId::Zstd).encode(plain)?;
    if pays_off(plain.len(), z.len()) {
        Ok((CodecId::Zstd, z))
    } else {
        Ok((CodecId::Store, codec_for(CodecId::Store).encode(plain)?))
    }
}

pub fn decode_frame(codec: CodecId, payload: &[u8], u_len: u64) -> Result<Vec<u8>> {
    codec_for(codec).decode(payload, u_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressible_frames_use_zstd() {
        let plain = vec![b'a'; 64 * 1024];
        let (id, payload) = encode_frame(&plain).unwrap();
        assert_eq!(id, CodecId::Zstd);
        assert!(payload.len() < plain.len());
        assert_eq!(decode_frame(id, &payload, plain.len() as u64).unwrap(), plain);
    }

    #[test]
    fn tiny_frames_fall_back_to_store() {
        let (id, payload) = encode_frame(b"xy").unwrap();
        assert_eq!(id, CodecId::Store);
        assert_eq!(payload, b"xy");
    }

    #[test]
    fn length_mismatch_is_format_error() {
        assert!(decode_frame(CodecId::Store, b"abc", 4).is_err());
        let (id, payload) = encode_frame(&[7u8; 4096]).unwrap();
        assert_eq!(id, CodecId::Zstd);
        assert!(decode_frame(id, &payload, 4095).is_err());
        assert!(decode_frame(id, &payload, 4097).is_err());
    }

    #[test]
    fn unknown_codec_byte_is_rejected() {
        assert!(CodecId::try_from(9u8).is_err());
    }
}
