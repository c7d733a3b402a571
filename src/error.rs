//! Error types for Veles.

use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Result type alias for Veles operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Veles.
#[derive(Error, Debug)]
pub enum Error {
    // Cryptographic errors
    #[error("cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    // Handshake errors
    #[error("handshake failed: {0}")]
    Handshake(String),

    // Framing errors
    #[error("oversize record: length {len} exceeds {max}")]
    OversizeRecord { len: usize, max: usize },

    #[error("connection closed")]
    ConnectionClosed,

    // Routing / registry errors
    #[error("peer {0} not found")]
    PeerNotFound(Ipv4Addr),

    #[error("address pool exhausted")]
    AddressPoolExhausted,

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid ciphertext length")]
    InvalidCiphertextLength,
}

impl Error {
    /// Whether this error must tear down the session.
    ///
    /// A failed decryption of a single record is tolerated: the record is
    /// dropped and the stream continues. Everything else on the tunnel path
    /// (framing violations, EOF mid-record, socket or TUN failures) is
    /// fatal for the session.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Crypto(CryptoError::DecryptionFailed(_) | CryptoError::InvalidCiphertextLength)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_failure_is_not_fatal() {
        let err = Error::Crypto(CryptoError::DecryptionFailed("tag mismatch".into()));
        assert!(!err.is_session_fatal());
    }

    #[test]
    fn framing_and_io_errors_are_fatal() {
        assert!(Error::OversizeRecord { len: 2801, max: 2800 }.is_session_fatal());
        assert!(Error::ConnectionClosed.is_session_fatal());
        assert!(Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "pipe")).is_session_fatal());
    }
}
