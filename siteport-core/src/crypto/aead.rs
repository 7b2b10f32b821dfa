use blake3::Hasher;
use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};

use crate::error::{Result, SiteportError};

#[derive(Clone)]
pub struct AeadKey(pub [u8; 32]);

/// Static region IDs (domain separation)
#[derive(Clone, Copy)]
pub enum Region {
    DumpLine = 1,
}

/// nonce = blake3(salt || region || counter).take(24)
pub fn derive_nonce(key_salt: &[u8; 32], region: Region, counter: u64) -> XNonce {
    let mut h = Hasher::new();
    h.update(key_salt);
    h.update(&[region as u8]);
    h.update(&counter.to_le_bytes());
    let out = h.finalize();
    XNonce::from_slice(&out.as_bytes()[..24]).to_owned()
}

pub fn seal_whole(key: &AeadKey, nonce: &XNonce, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let aead = XChaCha20Poly1305::new(Key::from_slice(&key.0));
    aead.encrypt(
        nonce,
        chacha20poly1305::aead::Payload {
            msg: plaintext,
            aad: ad,
        },
    )
    .map_err(|_| SiteportError::Crypto("aead encrypt failed".into()))
}

pub fn open_whole(key: &AeadKey, nonce: &XNonce, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let aead = XChaCha20Poly1305::new(Key::from_slice(&key.0));
    aead.decrypt(
        nonce,
        chacha20poly1305::aead::Payload {
            msg: ciphertext,
            aad: ad,
        },
    )
    .map_err(|_| SiteportError::Crypto("aead decrypt failed".into()))
}

/// Per-line sealing for SQL dumps. A line is bound to its byte offset in the
/// dump, so lines cannot be reordered or replayed elsewhere in the file.
#[derive(Clone)]
pub struct LineCipher {
    key: AeadKey,
    salt: [u8; 32],
}

impl LineCipher {
    pub fn new(key: [u8; 32], salt: [u8; 32]) -> Self {
        Self {
            key: AeadKey(key),
            salt,
        }
    }

    pub fn seal_line(&self, offset: u64, line: &str) -> Result<String> {
        let nonce = derive_nonce(&self.salt, Region::DumpLine, offset);
        let ct = seal_whole(&self.key, &nonce, b"dumpline", line.as_bytes())?;
        Ok(hex::encode(ct))
    }

    pub fn open_line(&self, offset: u64, sealed: &str) -> Result<String> {
        let ct = hex::decode(sealed.trim())
            .map_err(|e| SiteportError::Crypto(format!("dump line at {offset}: {e}")))?;
        let nonce = derive_nonce(&self.salt, Region::DumpLine, offset);
        let pt = open_whole(&self.key, &nonce, b"dumpline", &ct)?;
        String::from_utf8(pt).map_err(|e| SiteportError::Crypto(e.to_string()))
    }
}
