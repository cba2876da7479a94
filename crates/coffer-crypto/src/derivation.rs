//! Seed import and HKDF subkey derivation.
//!
//! The seed is the single root secret per user. Every derived key is
//! HKDF-SHA256 over the seed with a per-key salt (delivered by the server at
//! connection time) and a purpose label for domain separation.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{aead::AesKey, dh::DhSecret, error::CryptoError, hash::HmacKey};

/// Minimum seed length in bytes.
pub const MIN_SEED_LEN: usize = 32;

/// Purpose label for a derived subkey.
///
/// Distinct labels guarantee that the encryption key, the HMAC key, and the
/// DH scalar are independent even when two salts collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// AES-256-GCM key that wraps per-database keys.
    Encryption,
    /// HMAC-SHA256 key for server-opaque indices.
    Hmac,
    /// X25519 scalar for peer and server authentication.
    DiffieHellman,
}

impl KeyPurpose {
    /// HKDF info label for this purpose.
    #[must_use]
    pub fn label(self) -> &'static [u8] {
        match self {
            Self::Encryption => b"encryption",
            Self::Hmac => b"hmac",
            Self::DiffieHellman => b"diffie-hellman",
        }
    }
}

/// Imported root seed. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey(Vec<u8>);

impl MasterKey {
    /// Import a seed as the root of the key hierarchy.
    ///
    /// # Errors
    ///
    /// `CryptoError::WeakSeed` if the seed is shorter than
    /// [`MIN_SEED_LEN`] bytes.
    pub fn import(seed: &[u8]) -> Result<Self, CryptoError> {
        if seed.len() < MIN_SEED_LEN {
            return Err(CryptoError::WeakSeed { len: seed.len() });
        }
        Ok(Self(seed.to_vec()))
    }

    /// Derive the AES-256-GCM encryption key.
    #[must_use]
    pub fn derive_encryption_key(&self, salt: &[u8]) -> AesKey {
        AesKey::from_bytes(self.expand(salt, KeyPurpose::Encryption))
    }

    /// Derive the HMAC-SHA256 key.
    #[must_use]
    pub fn derive_hmac_key(&self, salt: &[u8]) -> HmacKey {
        HmacKey::from_bytes(self.expand(salt, KeyPurpose::Hmac))
    }

    /// Derive the X25519 scalar.
    #[must_use]
    pub fn derive_dh_secret(&self, salt: &[u8]) -> DhSecret {
        DhSecret::from_bytes(self.expand(salt, KeyPurpose::DiffieHellman))
    }

    fn expand(&self, salt: &[u8], purpose: KeyPurpose) -> [u8; 32] {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), &self.0);
        let mut okm = [0u8; 32];
        let Ok(()) = hkdf.expand(purpose.label(), &mut okm) else {
            unreachable!("invariant: 32 bytes is a valid HKDF-SHA256 output length");
        };
        okm
    }
}
