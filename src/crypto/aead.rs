//! Record encryption using AES-256-GCM.
//!
//! One record on the wire is `nonce || ciphertext || tag` with a fresh
//! random 96-bit nonce per record and no associated data. Random nonces are
//! safe to roughly 2^32 records per key; long-lived deployments should
//! rotate the pre-shared key before approaching that bound.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::CryptoError;

/// Key size for AES-256-GCM.
pub const KEY_SIZE: usize = 32;

/// Nonce size prepended to each record.
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size appended by the AEAD.
pub const TAG_SIZE: usize = 16;

/// Total per-record overhead (nonce + tag).
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Stateless per-record cipher over the pre-shared key.
pub struct RecordCipher {
    cipher: Aes256Gcm,
}

impl RecordCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        // new_from_slice only fails on wrong key length, which the array rules out.
        let cipher = Aes256Gcm::new_from_slice(key).expect("32-byte key");
        Self { cipher }
    }

    /// Seal a plaintext into `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_bytes: [u8; NONCE_SIZE] = super::random_bytes();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed("AEAD seal".into()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Open `nonce || ciphertext || tag` back into the plaintext.
    ///
    /// Fails without state change on truncated input or tag mismatch.
    pub fn open(&self, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if wire.len() < OVERHEAD {
            return Err(CryptoError::InvalidCiphertextLength);
        }

        let (nonce_bytes, ciphertext) = wire.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed("authentication failed".into()))
    }
}
