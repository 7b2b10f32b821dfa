use argon2::Argon2;

use crate::config::DumpKey;
use crate::error::{Result, SiteportError};

/// Resolve the dump key; passphrases are stretched with Argon2id over the package salt.
pub fn derive_key(key: &DumpKey, salt: &[u8; 32]) -> Result<[u8; 32]> {
    match key {
        DumpKey::Raw(k) => Ok(*k),
        DumpKey::Passphrase(p) => {
            let mut out = [0u8; 32];
            Argon2::default()
                .hash_password_into(p.as_bytes(), salt, &mut out)
                .map_err(|e| SiteportError::Crypto(format!("argon2: {e}")))?;
            Ok(out)
        }
    }
}

pub fn random_salt() -> Result<[u8; 32]> {
    let mut salt = [0u8; 32];
    getrandom::getrandom(&mut salt).map_err(|e| SiteportError::Crypto(e.to_string()))?;
    Ok(salt)
}
