//! Cryptographic primitives: pre-shared key handling and the record cipher.

pub mod aead;

pub use aead::{RecordCipher, KEY_SIZE, NONCE_SIZE, OVERHEAD, TAG_SIZE};

use std::path::Path;

use crate::error::{Error, Result};

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// The 32-byte symmetric key shared out-of-band by server and clients.
#[derive(Clone)]
pub struct PresharedKey([u8; KEY_SIZE]);

impl PresharedKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random key.
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Hex encoding for key files.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a key file: either 64 hex characters or exactly 32 raw bytes.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read key file: {e}")))?;

        if raw.len() == KEY_SIZE {
            let mut bytes = [0u8; KEY_SIZE];
            bytes.copy_from_slice(&raw);
            return Ok(Self(bytes));
        }

        let text = std::str::from_utf8(&raw)
            .map_err(|_| Error::InvalidKey("key file is neither raw bytes nor hex".into()))?
            .trim();
        Self::from_hex(text)
    }

    /// Parse from a hex string.
    pub fn from_hex(text: &str) -> Result<Self> {
        let decoded = hex::decode(text)
            .map_err(|e| Error::InvalidKey(format!("invalid hex: {e}")))?;
        let bytes: [u8; KEY_SIZE] = decoded
            .try_into()
            .map_err(|_| Error::InvalidKey(format!("key must be {KEY_SIZE} bytes")))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "PresharedKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let key = PresharedKey::generate();
        let parsed = PresharedKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key.as_bytes(), parsed.as_bytes());
    }

    #[test]
    fn rejects_short_keys() {
        assert!(PresharedKey::from_hex("deadbeef").is_err());
    }

    #[test]
    fn debug_does_not_leak() {
        let key = PresharedKey::generate();
        assert_eq!(format!("{key:?}"), "PresharedKey(..)");
    }
}
