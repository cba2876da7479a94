//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors produced by the primitives in this crate.
///
/// [`CryptoError::Authentication`] is deliberately its own variant: an AEAD
/// tag mismatch means either corruption or the wrong key, and callers treat
/// that differently from malformed inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// AEAD decryption failed authentication (wrong key or tampered data).
    #[error("authenticated decryption failed")]
    Authentication,

    /// Key material has the wrong length or shape.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Peer public key was rejected (malformed or low-order point).
    #[error("invalid peer public key")]
    InvalidPublicKey,

    /// Seed shorter than the minimum 32 bytes.
    #[error("seed too short: {len} bytes, need at least 32")]
    WeakSeed {
        /// Length of the rejected seed.
        len: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_is_distinct_from_invalid_key() {
        let auth = CryptoError::Authentication;
        let key = CryptoError::InvalidKey("bad".to_string());
        assert_ne!(auth, key);
    }
}
