//! Coffer Cryptographic Primitives
//!
//! Cryptographic building blocks for the Coffer client. Deterministic given
//! their inputs, except key and IV generation which draw from the OS CSPRNG.
//!
//! # Key Hierarchy
//!
//! Every key a user holds is derived from a single per-user seed combined
//! with server-stored salts:
//!
//! ```text
//! Seed (root secret, ≥ 32 bytes)
//!        │
//!        ▼
//! HKDF-SHA256(salt, purpose)
//!    ├──▶ encryption key (AES-256-GCM) — wraps per-database keys
//!    ├──▶ HMAC key — opaque server-side indices for names and item ids
//!    └──▶ DH scalar (X25519) — peer authentication and key exchange
//! ```
//!
//! Per-database keys are random AES-256-GCM keys, stored server-side wrapped
//! under the encryption key, and handed to other users wrapped under a
//! pairwise X25519 shared key.
//!
//! # Security
//!
//! - AES-GCM authentication failure is a distinct error kind
//!   ([`CryptoError::Authentication`]); callers decide whether it is fatal.
//! - All secret material zeroizes on drop.
//! - X25519 agreements reject non-contributory (low-order) peer points.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod derivation;
pub mod dh;
pub mod error;
pub mod hash;
pub mod random;

pub use aead::AesKey;
pub use derivation::{KeyPurpose, MasterKey};
pub use dh::DhSecret;
pub use error::CryptoError;
pub use hash::HmacKey;
