//! Access grants and seed transport.
//!
//! A grant hands a database key from its owner to another user without the
//! server ever seeing it: the key is wrapped under the pairwise X25519
//! shared key, and the acceptor rewraps it under their own encryption key
//! for storage. Seed pairing between two devices of one user moves the
//! root seed the same way, under a shared key with the requesting device's
//! ephemeral keypair.
//!
//! Wrapped payloads follow the wire convention: the AEAD plaintext is the
//! base64 form of the secret, and the ciphertext is base64-encoded again
//! for the envelope.

use coffer_crypto::{aead, dh, hash, AesKey, DhSecret};
use coffer_proto::{bundle, AcceptDatabaseAccessParams, DatabaseAccessGrant, ProtoError};
use zeroize::Zeroizing;

use crate::{database, error::Error};

/// A pending grant after decryption, held until the user confirms the
/// owner's fingerprint.
pub struct GrantOffer {
    /// Server-assigned database id.
    pub db_id: String,
    /// The unwrapped database key.
    pub db_key: AesKey,
    /// Decrypted database name.
    pub db_name: String,
    /// Fingerprint of the owner's public key, for out-of-band verification.
    pub owner_fingerprint: String,
    /// Whether the grant is read-only.
    pub read_only: bool,
}

/// Wrap a database key under the user's own encryption key.
#[must_use]
pub fn wrap_db_key(encryption_key: &AesKey, db_key: &AesKey) -> String {
    let plaintext = bundle::to_base64(db_key.as_bytes());
    bundle::to_base64(&aead::encrypt(encryption_key, plaintext.as_bytes()))
}

/// Unwrap a database key wrapped under the user's own encryption key.
///
/// # Errors
///
/// `CryptoError::Authentication` on a wrong key or tampered payload, codec
/// errors on malformed contents.
pub fn unwrap_db_key(encryption_key: &AesKey, encrypted: &str) -> Result<AesKey, Error> {
    let ciphertext = bundle::from_base64(encrypted)?;
    let plaintext = aead::decrypt(encryption_key, &ciphertext)?;
    let key_b64 = std::str::from_utf8(&plaintext)
        .map_err(|_| ProtoError::Envelope("wrapped key is not utf-8".to_string()))?;
    let raw = bundle::from_base64(key_b64)?;
    Ok(AesKey::from_slice(&raw)?)
}

/// Wrap a database key for a peer under the pairwise DH shared key.
///
/// # Errors
///
/// `CryptoError::InvalidPublicKey` if the peer's point is rejected.
pub fn wrap_db_key_for_peer(
    own_dh: &DhSecret,
    peer_public: &[u8; 32],
    db_key: &AesKey,
) -> Result<String, Error> {
    let shared = dh::shared_key(own_dh, peer_public)?;
    Ok(wrap_db_key(&shared, db_key))
}

/// Unwrap a database key a peer wrapped for us.
///
/// # Errors
///
/// `CryptoError::Authentication` if the shared keys do not match.
pub fn unwrap_db_key_from_peer(
    own_dh: &DhSecret,
    peer_public: &[u8; 32],
    encrypted: &str,
) -> Result<AesKey, Error> {
    let shared = dh::shared_key(own_dh, peer_public)?;
    unwrap_db_key(&shared, encrypted)
}

/// Encrypt a database name under the database key.
#[must_use]
pub fn encrypt_db_name(db_key: &AesKey, db_name: &str) -> String {
    bundle::to_base64(&aead::encrypt(db_key, db_name.as_bytes()))
}

/// Decrypt a database name.
///
/// # Errors
///
/// `CryptoError::Authentication` on a wrong key, codec errors otherwise.
pub fn decrypt_db_name(db_key: &AesKey, encrypted: &str) -> Result<String, Error> {
    let ciphertext = bundle::from_base64(encrypted)?;
    let plaintext = aead::decrypt(db_key, &ciphertext)?;
    String::from_utf8(plaintext.to_vec())
        .map_err(|_| Error::Proto(ProtoError::Envelope("db name is not utf-8".to_string())))
}

/// Encrypt the seed for a requesting device under the pairing shared key.
///
/// # Errors
///
/// `CryptoError::InvalidPublicKey` if the requester's point is rejected.
pub fn encrypt_seed(
    own_dh: &DhSecret,
    requester_public: &[u8; 32],
    seed: &[u8],
) -> Result<String, Error> {
    let shared = dh::shared_key(own_dh, requester_public)?;
    let plaintext = bundle::to_base64(seed);
    Ok(bundle::to_base64(&aead::encrypt(&shared, plaintext.as_bytes())))
}

/// Decrypt a seed received from a paired device.
///
/// # Errors
///
/// `CryptoError::Authentication` if the pairing keys do not match.
pub fn decrypt_seed(
    request_secret: &DhSecret,
    sender_public: &[u8; 32],
    encrypted: &str,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let shared = dh::shared_key(request_secret, sender_public)?;
    let ciphertext = bundle::from_base64(encrypted)?;
    let plaintext = aead::decrypt(&shared, &ciphertext)?;
    let seed_b64 = std::str::from_utf8(&plaintext)
        .map_err(|_| ProtoError::Envelope("seed payload is not utf-8".to_string()))?;
    Ok(Zeroizing::new(bundle::from_base64(seed_b64)?))
}

/// Decrypt one pending grant into an offer the user can confirm.
///
/// # Errors
///
/// Any crypto or codec failure; callers isolate these per grant.
pub fn decrypt_grant(own_dh: &DhSecret, grant: &DatabaseAccessGrant) -> Result<GrantOffer, Error> {
    let owner_public = hash::to_32(&bundle::from_base64(&grant.owner_public_key)?)?;
    let db_key = unwrap_db_key_from_peer(own_dh, &owner_public, &grant.encrypted_access_key)?;
    let db_name = decrypt_db_name(&db_key, &grant.encrypted_db_name)?;

    Ok(GrantOffer {
        db_id: grant.db_id.clone(),
        owner_fingerprint: hash::fingerprint(&owner_public),
        db_key,
        db_name,
        read_only: grant.read_only,
    })
}

/// Build the `AcceptDatabaseAccess` parameters for a confirmed offer: the
/// database key rewrapped under the acceptor's own encryption key, plus the
/// acceptor's own name hash and an encrypted copy of the name.
#[must_use]
pub fn accept_params(
    encryption_key: &AesKey,
    hmac_key: &coffer_crypto::HmacKey,
    offer: &GrantOffer,
) -> AcceptDatabaseAccessParams {
    AcceptDatabaseAccessParams {
        db_id: offer.db_id.clone(),
        encrypted_db_key: wrap_db_key(encryption_key, &offer.db_key),
        db_name_hash: database::db_name_hash(hmac_key, &offer.db_name),
        encrypted_db_name: encrypt_db_name(&offer.db_key, &offer.db_name),
    }
}

#[cfg(test)]
mod tests {
    use coffer_crypto::{random, CryptoError, HmacKey};

    use super::*;

    #[test]
    fn db_key_wrap_roundtrip() {
        let encryption_key = random::generate_key();
        let db_key = random::generate_key();

        let wrapped = wrap_db_key(&encryption_key, &db_key);
        let unwrapped = unwrap_db_key(&encryption_key, &wrapped).unwrap();
        assert_eq!(unwrapped.as_bytes(), db_key.as_bytes());
    }

    #[test]
    fn peer_wrap_unwraps_on_the_other_side() {
        let (owner, owner_pub) = dh::generate_keypair();
        let (grantee, grantee_pub) = dh::generate_keypair();
        let db_key = random::generate_key();

        let wrapped = wrap_db_key_for_peer(&owner, &grantee_pub, &db_key).unwrap();
        let unwrapped = unwrap_db_key_from_peer(&grantee, &owner_pub, &wrapped).unwrap();
        assert_eq!(unwrapped.as_bytes(), db_key.as_bytes());
    }

    #[test]
    fn wrong_recipient_cannot_unwrap() {
        let (owner, owner_pub) = dh::generate_keypair();
        let (_, grantee_pub) = dh::generate_keypair();
        let (eve, _) = dh::generate_keypair();

        let wrapped =
            wrap_db_key_for_peer(&owner, &grantee_pub, &random::generate_key()).unwrap();
        let err = unwrap_db_key_from_peer(&eve, &owner_pub, &wrapped).unwrap_err();
        assert_eq!(err, Error::Crypto(CryptoError::Authentication));
    }

    #[test]
    fn db_name_roundtrip() {
        let db_key = random::generate_key();
        let encrypted = encrypt_db_name(&db_key, "todo-list");
        assert_eq!(decrypt_db_name(&db_key, &encrypted).unwrap(), "todo-list");
    }

    #[test]
    fn seed_transport_roundtrip() {
        // The requesting device's ephemeral pair and the sender's derived
        // DH identity.
        let (request_secret, request_pub) = dh::generate_keypair();
        let (sender, sender_pub) = dh::generate_keypair();
        let seed = b"0123456789abcdef0123456789abcdef";

        let encrypted = encrypt_seed(&sender, &request_pub, seed).unwrap();
        let decrypted = decrypt_seed(&request_secret, &sender_pub, &encrypted).unwrap();
        assert_eq!(decrypted.as_slice(), seed);
    }

    #[test]
    fn grant_roundtrip_through_wire_form() {
        let (owner, owner_pub) = dh::generate_keypair();
        let (grantee, _) = dh::generate_keypair();
        let grantee_pub = grantee.public_key();
        let db_key = random::generate_key();

        let grant = DatabaseAccessGrant {
            db_id: "db-9".to_string(),
            owner_public_key: bundle::to_base64(&owner_pub),
            encrypted_access_key: wrap_db_key_for_peer(&owner, &grantee_pub, &db_key).unwrap(),
            encrypted_db_name: encrypt_db_name(&db_key, "shared-notes"),
            read_only: true,
        };

        let offer = decrypt_grant(&grantee, &grant).unwrap();
        assert_eq!(offer.db_name, "shared-notes");
        assert_eq!(offer.db_id, "db-9");
        assert!(offer.read_only);
        assert_eq!(offer.owner_fingerprint, hash::fingerprint(&owner_pub));

        // Acceptance rewraps under the acceptor's own keys.
        let encryption_key = random::generate_key();
        let hmac_key = HmacKey::from_bytes([5u8; 32]);
        let params = accept_params(&encryption_key, &hmac_key, &offer);

        let rewrapped = unwrap_db_key(&encryption_key, &params.encrypted_db_key).unwrap();
        assert_eq!(rewrapped.as_bytes(), db_key.as_bytes());
        assert_eq!(params.db_name_hash, database::db_name_hash(&hmac_key, "shared-notes"));
        assert_eq!(decrypt_db_name(&db_key, &params.encrypted_db_name).unwrap(), "shared-notes");
    }

    #[test]
    fn tampered_grant_fails_isolated() {
        let (owner, owner_pub) = dh::generate_keypair();
        let (grantee, _) = dh::generate_keypair();
        let db_key = random::generate_key();

        let mut grant = DatabaseAccessGrant {
            db_id: "db-9".to_string(),
            owner_public_key: bundle::to_base64(&owner_pub),
            encrypted_access_key: wrap_db_key_for_peer(&owner, &grantee.public_key(), &db_key)
                .unwrap(),
            encrypted_db_name: encrypt_db_name(&db_key, "x"),
            read_only: false,
        };
        grant.encrypted_access_key = grant.encrypted_access_key.to_lowercase();

        assert!(decrypt_grant(&grantee, &grant).is_err());
    }
}
