//! SHA-256, HMAC-SHA256, and public-key fingerprints.
//!
//! HMAC tags are what the server indexes by: database names and item ids
//! never leave the device in plaintext, but the same name always produces
//! the same tag under the same key, so the server can still key its log by
//! them.

use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 key (32 bytes). Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HmacKey([u8; 32]);

impl HmacKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Clone for HmacKey {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

/// SHA-256 digest of `data`.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// HMAC-SHA256 tag over `data`.
///
/// Deterministic: the same key and data always produce the same tag.
#[must_use]
pub fn hmac_sign(key: &HmacKey, data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .unwrap_or_else(|_| unreachable!("invariant: HMAC accepts 32-byte keys"));
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Short human-checkable fingerprint of a public key.
///
/// base64(SHA-256(input)). Shown to users before confirming a seed send or
/// an access grant so both sides can compare devices out of band.
#[must_use]
pub fn fingerprint(public_key: &[u8]) -> String {
    STANDARD.encode(sha256(public_key))
}

/// Parse a 32-byte value from a slice.
///
/// # Errors
///
/// `CryptoError::InvalidKey` if the slice is not exactly 32 bytes.
pub fn to_32(bytes: &[u8]) -> Result<[u8; 32], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))
}
