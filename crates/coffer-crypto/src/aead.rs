//! Authenticated encryption with AES-256-GCM.
//!
//! Key size: 32 bytes. IV: 12 bytes (random, CSPRNG). Tag: 16 bytes.
//! No additional authenticated data.
//!
//! Ciphertext wire format:
//!   [ iv (12 bytes) | ciphertext + tag ]

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// AES-GCM IV length in bytes (96 bits).
pub const IV_LEN: usize = 12;

/// AES-256-GCM key. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct AesKey([u8; 32]);

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesKey(REDACTED)")
    }
}

impl AesKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a key from a slice.
    ///
    /// # Errors
    ///
    /// `CryptoError::InvalidKey` if the slice is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        crate::hash::to_32(bytes).map(Self)
    }

    /// Key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Clone for AesKey {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

/// Encrypt `plaintext`, prepending a fresh random 12-byte IV.
#[must_use]
pub fn encrypt(key: &AesKey, plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let iv = Aes256Gcm::generate_nonce(&mut OsRng);

    let Ok(ciphertext) = cipher.encrypt(&iv, plaintext) else {
        unreachable!("invariant: AES-GCM encryption cannot fail with valid inputs");
    };

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt wire-format bytes (iv || ciphertext+tag).
///
/// The plaintext is returned zeroizing since it is usually key material or
/// user records.
///
/// # Errors
///
/// `CryptoError::Authentication` on truncated input, tag mismatch, or a
/// wrong key. The three are indistinguishable on purpose.
pub fn decrypt(key: &AesKey, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < IV_LEN {
        return Err(CryptoError::Authentication);
    }
    let (iv, ciphertext) = data.split_at(IV_LEN);

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::Authentication)?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(fill: u8) -> AesKey {
        AesKey::from_bytes([fill; 32])
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = test_key(1);
        let plaintext = b"a record worth protecting";

        let ciphertext = encrypt(&key, plaintext);
        let decrypted = decrypt(&key, &ciphertext).unwrap();

        assert_eq!(decrypted.as_slice(), plaintext);
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = test_key(2);
        let ciphertext = encrypt(&key, b"");
        assert_eq!(ciphertext.len(), IV_LEN + 16, "iv plus tag only");
        assert!(decrypt(&key, &ciphertext).unwrap().is_empty());
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let ciphertext = encrypt(&test_key(1), b"secret");
        let result = decrypt(&test_key(2), &ciphertext);
        assert_eq!(result.unwrap_err(), CryptoError::Authentication);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let key = test_key(3);
        let mut ciphertext = encrypt(&key, b"secret");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert_eq!(decrypt(&key, &ciphertext).unwrap_err(), CryptoError::Authentication);
    }

    #[test]
    fn truncated_input_fails_authentication() {
        let key = test_key(4);
        assert_eq!(decrypt(&key, &[0u8; 5]).unwrap_err(), CryptoError::Authentication);
        assert_eq!(decrypt(&key, &[]).unwrap_err(), CryptoError::Authentication);
    }

    #[test]
    fn ciphertexts_are_randomized() {
        let key = test_key(5);
        let a = encrypt(&key, b"same plaintext");
        let b = encrypt(&key, b"same plaintext");
        assert_ne!(a, b, "fresh IV per encryption");
    }

    #[test]
    fn from_slice_validates_length() {
        assert!(AesKey::from_slice(&[0u8; 16]).is_err());
        assert!(AesKey::from_slice(&[0u8; 32]).is_ok());
    }
}
