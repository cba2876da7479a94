//! Derived key set and seed-request keys.
//!
//! The key set exists only after a valid seed has been combined with the
//! server-delivered salts. It is set once per connection, read-only
//! afterwards, and dropped (zeroizing) on close.

use coffer_crypto::{dh, AesKey, CryptoError, DhSecret, HmacKey, MasterKey};
use coffer_proto::{bundle, SaltsWire};

use crate::error::Error;

/// Per-user HKDF salts, delivered by the server at connection time and
/// immutable for the life of the account.
pub struct Salts {
    /// Salt for the encryption key.
    pub encryption_key_salt: Vec<u8>,
    /// Salt for the DH scalar.
    pub dh_key_salt: Vec<u8>,
    /// Salt for the HMAC key.
    pub hmac_key_salt: Vec<u8>,
}

impl Salts {
    /// Decode salts from their wire form.
    ///
    /// # Errors
    ///
    /// [`Error::Proto`] on malformed base64.
    pub fn from_wire(wire: &SaltsWire) -> Result<Self, Error> {
        Ok(Self {
            encryption_key_salt: bundle::from_base64(&wire.encryption_key_salt)?,
            dh_key_salt: bundle::from_base64(&wire.dh_key_salt)?,
            hmac_key_salt: bundle::from_base64(&wire.hmac_key_salt)?,
        })
    }
}

/// The full derived key set.
pub struct KeySet {
    /// Wraps per-database keys for server-side storage.
    pub encryption: AesKey,
    /// Hashes database names and item ids into server-opaque indices.
    pub hmac: HmacKey,
    /// Authenticates this user to the server and to peers.
    pub dh: DhSecret,
}

impl KeySet {
    /// Derive all three keys from the seed and salts.
    ///
    /// One derivation chain: the same seed and salts always produce the
    /// same set, which is what makes `ValidateKey` a proof of seed
    /// possession.
    ///
    /// # Errors
    ///
    /// `CryptoError::WeakSeed` for seeds shorter than 32 bytes.
    pub fn derive(seed: &[u8], salts: &Salts) -> Result<Self, CryptoError> {
        let master = MasterKey::import(seed)?;
        Ok(Self {
            encryption: master.derive_encryption_key(&salts.encryption_key_salt),
            hmac: master.derive_hmac_key(&salts.hmac_key_salt),
            dh: master.derive_dh_secret(&salts.dh_key_salt),
        })
    }
}

/// Ephemeral keypair a seedless device publishes to solicit the seed from a
/// paired device.
pub struct SeedRequestKeys {
    secret: DhSecret,
    public: [u8; 32],
}

/// Persisted form of [`SeedRequestKeys`] (base64 halves), stored under
/// `seedRequest:<username>` so a restart can resume the same handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSeedRequest {
    /// base64 scalar bytes.
    pub private_key: String,
    /// base64 public key bytes.
    pub public_key: String,
}

impl SeedRequestKeys {
    /// Generate a fresh ephemeral pair.
    #[must_use]
    pub fn generate() -> Self {
        let (secret, public) = dh::generate_keypair();
        Self { secret, public }
    }

    /// The scalar half.
    #[must_use]
    pub fn secret(&self) -> &DhSecret {
        &self.secret
    }

    /// The public half, published to the server.
    #[must_use]
    pub fn public(&self) -> &[u8; 32] {
        &self.public
    }

    /// Serialize for the local store.
    #[must_use]
    pub fn to_stored(&self) -> StoredSeedRequest {
        StoredSeedRequest {
            private_key: bundle::to_base64(&self.secret.to_bytes()),
            public_key: bundle::to_base64(&self.public),
        }
    }

    /// Restore from the local store.
    ///
    /// # Errors
    ///
    /// A proto error on malformed base64 or a crypto error on a
    /// wrong-length key.
    pub fn from_stored(stored: &StoredSeedRequest) -> Result<Self, Error> {
        let secret_bytes = bundle::from_base64(&stored.private_key)?;
        let public_bytes = bundle::from_base64(&stored.public_key)?;
        let secret = DhSecret::from_bytes(coffer_crypto::hash::to_32(&secret_bytes)?);
        let public = coffer_crypto::hash::to_32(&public_bytes)?;
        Ok(Self { secret, public })
    }

    /// Fingerprint of the public half, shown to the user as the device id
    /// the paired device must verify before sending the seed.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        coffer_crypto::hash::fingerprint(&self.public)
    }
}
