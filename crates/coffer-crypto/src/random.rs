//! CSPRNG key and seed generation.

use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::aead::AesKey;

/// Length of a freshly generated seed in bytes.
pub const SEED_LEN: usize = 32;

/// Generate a random AES-256-GCM key (used as a per-database key).
#[must_use]
pub fn generate_key() -> AesKey {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    AesKey::from_bytes(bytes)
}

/// Generate a random root seed.
#[must_use]
pub fn generate_seed() -> Zeroizing<Vec<u8>> {
    let mut bytes = vec![0u8; SEED_LEN];
    OsRng.fill_bytes(&mut bytes);
    Zeroizing::new(bytes)
}
