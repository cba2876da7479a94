//! Bundle snapshot codec.
//!
//! A bundle is the full state of a database at one sequence number:
//! the item map plus the insertion-order index. On the wire it is
//! base64(AES-GCM(deflate(JSON))); this module owns the JSON shape, the
//! DEFLATE stage, and the base64 stage. Encryption sits between them and
//! belongs to the replication engine, which holds the database key.

use std::{
    collections::BTreeMap,
    io::{Read, Write},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtoError;

/// Cap on decompressed bundle size. A malicious or buggy server cannot make
/// the client materialize more than this from one bundle.
pub const MAX_DECOMPRESSED_LEN: usize = 64 * 1024 * 1024;

/// One stored item inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotItem {
    /// Decrypted record.
    pub record: Value,
    /// Sequence number of the transaction that last wrote this item.
    pub seq_no: u64,
}

/// One entry of the insertion-order index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    /// Item id.
    pub item_id: String,
    /// Sequence number of the item's first insert.
    pub seq_no: u64,
}

/// Full database state at one sequence number.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleSnapshot {
    /// Item id → stored item.
    pub items: BTreeMap<String, SnapshotItem>,
    /// Insertion order by first-seen transaction.
    pub items_index: Vec<IndexEntry>,
}

impl BundleSnapshot {
    /// Serialize and compress the snapshot plaintext.
    ///
    /// # Errors
    ///
    /// `ProtoError::Json` or `ProtoError::Compression` on failure.
    pub fn to_compressed(&self) -> Result<Vec<u8>, ProtoError> {
        let json = serde_json::to_vec(self)?;
        compress(&json)
    }

    /// Decompress and parse snapshot plaintext.
    ///
    /// # Errors
    ///
    /// `ProtoError::Compression`, `ProtoError::BundleTooLarge`, or
    /// `ProtoError::Json` on failure.
    pub fn from_compressed(data: &[u8]) -> Result<Self, ProtoError> {
        let json = decompress(data)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

/// DEFLATE-compress `data`.
///
/// # Errors
///
/// `ProtoError::Compression` if the encoder fails.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map_err(|e| ProtoError::Compression(e.to_string()))
}

/// DEFLATE-decompress `data`, enforcing [`MAX_DECOMPRESSED_LEN`].
///
/// # Errors
///
/// `ProtoError::BundleTooLarge` if the plaintext exceeds the cap,
/// `ProtoError::Compression` on malformed input.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let mut decoder = DeflateDecoder::new(data).take(MAX_DECOMPRESSED_LEN as u64 + 1);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ProtoError::Compression(e.to_string()))?;
    if out.len() > MAX_DECOMPRESSED_LEN {
        return Err(ProtoError::BundleTooLarge { max: MAX_DECOMPRESSED_LEN });
    }
    Ok(out)
}

/// base64-encode bytes for the wire.
#[must_use]
pub fn to_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode base64 from the wire.
///
/// # Errors
///
/// `ProtoError::Base64` on malformed input.
pub fn from_base64(data: &str) -> Result<Vec<u8>, ProtoError> {
    Ok(STANDARD.decode(data)?)
}
