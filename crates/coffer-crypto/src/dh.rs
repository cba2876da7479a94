//! X25519 key agreement.
//!
//! Two flavors of agreement:
//! - with a peer (another device or user), whose public key arrives over
//!   the wire and is verified out of band via fingerprint, and
//! - with the server, whose public key is compiled in.
//!
//! The raw X25519 shared secret is never used directly: it is run through
//! HKDF-SHA256 to produce an AES-256-GCM key.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{aead::AesKey, error::CryptoError};

/// HKDF info label for agreement-derived AES keys.
const SHARED_KEY_LABEL: &[u8] = b"coffer shared key v1";

/// Public key of the deployment's server, compiled in.
///
/// The server proves possession of the matching scalar through the
/// key-validation handshake at connect time.
pub const SERVER_PUBLIC_KEY: [u8; 32] = [
    0x5a, 0x1e, 0x8f, 0x33, 0xc2, 0x04, 0x71, 0xbd, 0x9e, 0x52, 0x07, 0xe6, 0x4b, 0xd0, 0x2b,
    0x18, 0x6f, 0xa1, 0x44, 0x29, 0x85, 0x1c, 0xf3, 0x60, 0x9b, 0x77, 0x0e, 0xd2, 0x38, 0x4c,
    0xaa, 0x41,
];

/// X25519 scalar. The inner secret zeroizes on drop.
pub struct DhSecret(StaticSecret);

impl DhSecret {
    /// Wrap raw scalar bytes (clamped per RFC 7748).
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Generate a fresh random scalar from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    /// Corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.0).to_bytes()
    }

    /// Raw scalar bytes, for persistence of ephemeral seed-request keys.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

/// Derive the pairwise AES key shared with `peer_public`.
///
/// # Errors
///
/// `CryptoError::InvalidPublicKey` if the agreement is non-contributory
/// (the peer sent a low-order point).
pub fn shared_key(secret: &DhSecret, peer_public: &[u8; 32]) -> Result<AesKey, CryptoError> {
    let peer = PublicKey::from(*peer_public);
    let shared = secret.0.diffie_hellman(&peer);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; 32];
    let Ok(()) = hkdf.expand(SHARED_KEY_LABEL, &mut okm) else {
        unreachable!("invariant: 32 bytes is a valid HKDF-SHA256 output length");
    };

    Ok(AesKey::from_bytes(okm))
}

/// Derive the AES key shared with the compiled-in server key.
///
/// # Errors
///
/// `CryptoError::InvalidPublicKey` if the agreement is non-contributory.
pub fn shared_key_with_server(secret: &DhSecret) -> Result<AesKey, CryptoError> {
    shared_key(secret, &SERVER_PUBLIC_KEY)
}

/// Generate an ephemeral keypair for the seed-request handshake.
#[must_use]
pub fn generate_keypair() -> (DhSecret, [u8; 32]) {
    let secret = DhSecret::generate();
    let public = secret.public_key();
    (secret, public)
}
