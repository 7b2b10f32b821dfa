//! Hex forms of the fixed-size secrets that travel through state and env.

use crate::error::{Result, SiteportError};

/// Decode exactly `N` bytes; surrounding whitespace is ignored.
pub fn parse_hex_array<const N: usize>(hex_str: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| SiteportError::Crypto(format!("invalid hex: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        SiteportError::Crypto(format!(
            "expected {N} bytes ({} hex chars), got {}",
            N * 2,
            b.len()
        ))
    })
}

/// Salt as recorded in `dump_salt` and in package meta.
pub fn salt_to_hex(salt: &[u8; 32]) -> String {
    hex::encode(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_length() {
        assert!(parse_hex_array::<4>("0011").is_err());
        assert!(parse_hex_array::<2>("zz00").is_err());
        assert_eq!(parse_hex_array::<2>(" 0a0b ").unwrap(), [0x0a, 0x0b]);
    }

    #[test]
    fn salt_survives_state_encoding() {
        let salt = [0xabu8; 32];
        let text = salt_to_hex(&salt);
        assert_eq!(text.len(), 64);
        assert_eq!(parse_hex_array::<32>(&text).unwrap(), salt);
    }
}
