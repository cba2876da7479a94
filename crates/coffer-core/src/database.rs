//! In-memory database replica.
//!
//! A database is replayed, never mutated locally: the server's transaction
//! log is the single source of truth, and this engine folds an encrypted
//! bundle snapshot plus the incremental log into a deterministic item set.
//!
//! # Invariants
//!
//! - `items` and `items_index` hold exactly the same item ids.
//! - `items_index` order is the order of each id's first applied insert;
//!   updates and deletes never reorder surviving entries.
//! - `last_seq_no` never decreases; a transaction at or below it is a no-op.

use std::collections::HashMap;

use coffer_crypto::{aead, hash, AesKey, HmacKey};
use coffer_proto::{
    bundle::{self, BundleSnapshot, IndexEntry, SnapshotItem},
    Command, Transaction,
};
use serde_json::Value;
use tracing::debug;

use crate::error::Error;

/// One decrypted operation from the log.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Add an item. Idempotent: an existing id is left untouched.
    Insert {
        /// Caller-supplied item id.
        item_id: String,
        /// Decrypted record.
        record: Value,
    },
    /// Replace an item's record. An absent id is ignored.
    Update {
        /// Caller-supplied item id.
        item_id: String,
        /// Decrypted record.
        record: Value,
    },
    /// Remove an item. An absent id is ignored.
    Delete {
        /// Caller-supplied item id.
        item_id: String,
    },
}

/// One log entry after decryption: a sequence number and the operations it
/// carries. Plain transactions carry one op; batches carry several and are
/// atomic with respect to change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// Server-assigned sequence number.
    pub seq_no: u64,
    /// Operations, applied in order.
    pub ops: Vec<Op>,
}

/// One entry of [`Database::item_views`], in insertion order.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemView {
    /// Caller-supplied item id.
    pub item_id: String,
    /// Decrypted record.
    pub record: Value,
}

/// A freshly built snapshot, ready to submit via the `Bundle` action.
#[derive(Debug, Clone)]
pub struct BuiltBundle {
    /// Sequence number the snapshot covers.
    pub seq_no: u64,
    /// base64(AES-GCM(deflate(JSON snapshot))).
    pub bundle: String,
    /// HMAC item keys in index order, for server-side garbage collection.
    pub keys: Vec<String>,
}

/// The replica: item map, insertion-order index, and replay cursor.
pub struct Database {
    db_name: String,
    db_name_hash: String,
    db_id: Option<String>,
    db_key: Option<AesKey>,
    items: HashMap<String, SnapshotItem>,
    items_index: Vec<IndexEntry>,
    last_seq_no: u64,
    init: bool,
}

/// Server-opaque index for a database name: base64(HMAC(hmac_key, name)).
#[must_use]
pub fn db_name_hash(hmac_key: &HmacKey, db_name: &str) -> String {
    bundle::to_base64(&hash::hmac_sign(hmac_key, db_name.as_bytes()))
}

/// Server-opaque index for an item id: base64(HMAC(hmac_key, item_id)).
#[must_use]
pub fn item_key(hmac_key: &HmacKey, item_id: &str) -> String {
    bundle::to_base64(&hash::hmac_sign(hmac_key, item_id.as_bytes()))
}

impl Database {
    /// New, empty, uninitialized replica.
    #[must_use]
    pub fn new(db_name: String, db_name_hash: String) -> Self {
        Self {
            db_name,
            db_name_hash,
            db_id: None,
            db_key: None,
            items: HashMap::new(),
            items_index: Vec::new(),
            last_seq_no: 0,
            init: false,
        }
    }

    /// Database name as the caller knows it.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.db_name
    }

    /// HMAC name hash, the server's index key.
    #[must_use]
    pub fn name_hash(&self) -> &str {
        &self.db_name_hash
    }

    /// Server-assigned id, once the first push has arrived.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.db_id.as_deref()
    }

    /// The unwrapped database key, once the first push has arrived.
    #[must_use]
    pub fn key(&self) -> Option<&AesKey> {
        self.db_key.as_ref()
    }

    /// Whether the first bundle+log push has been applied.
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.init
    }

    /// Highest applied sequence number.
    #[must_use]
    pub fn last_seq_no(&self) -> u64 {
        self.last_seq_no
    }

    /// Number of live items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the replica holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Record the server-assigned id (first push).
    pub fn set_id(&mut self, db_id: String) {
        self.db_id = Some(db_id);
    }

    /// Record the unwrapped database key (first push).
    pub fn set_key(&mut self, db_key: AesKey) {
        self.db_key = Some(db_key);
    }

    /// Mark the first push as applied.
    pub fn mark_init(&mut self) {
        self.init = true;
    }

    /// Replace state from a decrypted snapshot; the incremental log is
    /// applied afterwards.
    pub fn apply_snapshot(&mut self, snapshot: BundleSnapshot, bundle_seq_no: u64) {
        self.items = snapshot.items.into_iter().collect();
        self.items_index = snapshot.items_index;
        self.last_seq_no = bundle_seq_no;
    }

    /// Decrypt and apply an encrypted wire bundle.
    ///
    /// # Errors
    ///
    /// `CryptoError::Authentication` (fatal to the connection per the
    /// propagation policy) or a codec error on malformed contents.
    pub fn apply_encrypted_bundle(
        &mut self,
        wire_bundle: &str,
        bundle_seq_no: u64,
    ) -> Result<(), Error> {
        let db_key =
            self.db_key.as_ref().ok_or_else(|| Error::DatabaseNotOpen(self.db_name.clone()))?;
        let ciphertext = bundle::from_base64(wire_bundle)?;
        let compressed = aead::decrypt(db_key, &ciphertext)?;
        let snapshot = BundleSnapshot::from_compressed(&compressed)?;
        self.apply_snapshot(snapshot, bundle_seq_no);
        Ok(())
    }

    /// Decrypt a transaction log into mutations, using this replica's key.
    ///
    /// # Errors
    ///
    /// `CryptoError::Authentication` on any record that fails to decrypt
    /// (fatal to the connection), or a codec error on malformed entries.
    pub fn decrypt_log(&self, log: &[Transaction]) -> Result<Vec<Mutation>, Error> {
        let db_key =
            self.db_key.as_ref().ok_or_else(|| Error::DatabaseNotOpen(self.db_name.clone()))?;

        log.iter().map(|tx| decrypt_transaction(db_key, tx)).collect()
    }

    /// Apply mutations in order, skipping anything at or below the replay
    /// cursor. Returns how many mutations were applied.
    pub fn apply_mutations(&mut self, mutations: Vec<Mutation>) -> usize {
        let mut applied = 0;

        for mutation in mutations {
            if mutation.seq_no <= self.last_seq_no {
                debug!(
                    seq_no = mutation.seq_no,
                    last_seq_no = self.last_seq_no,
                    db = %self.db_name_hash,
                    "skipping already-applied transaction"
                );
                continue;
            }

            for op in mutation.ops {
                self.apply_op(op, mutation.seq_no);
            }
            self.last_seq_no = mutation.seq_no;
            applied += 1;
        }

        applied
    }

    fn apply_op(&mut self, op: Op, seq_no: u64) {
        match op {
            Op::Insert { item_id, record } => {
                if self.items.contains_key(&item_id) {
                    return;
                }
                self.items_index.push(IndexEntry { item_id: item_id.clone(), seq_no });
                self.items.insert(item_id, SnapshotItem { record, seq_no });
            },
            Op::Update { item_id, record } => {
                if let Some(item) = self.items.get_mut(&item_id) {
                    item.record = record;
                    item.seq_no = seq_no;
                }
            },
            Op::Delete { item_id } => {
                if self.items.remove(&item_id).is_some() {
                    self.items_index.retain(|entry| entry.item_id != item_id);
                }
            },
        }
    }

    /// Current items in insertion order, as handed to change subscribers.
    #[must_use]
    pub fn item_views(&self) -> Vec<ItemView> {
        self.items_index
            .iter()
            .filter_map(|entry| {
                self.items.get(&entry.item_id).map(|item| ItemView {
                    item_id: entry.item_id.clone(),
                    record: item.record.clone(),
                })
            })
            .collect()
    }

    /// Snapshot the current state.
    #[must_use]
    pub fn snapshot(&self) -> BundleSnapshot {
        BundleSnapshot {
            items: self.items.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            items_index: self.items_index.clone(),
        }
    }

    /// Build an encrypted bundle of the current state, plus the HMAC item
    /// keys the server garbage-collects superseded transactions by.
    ///
    /// # Errors
    ///
    /// [`Error::DatabaseNotOpen`] before the key arrived, or a codec error.
    pub fn build_bundle(&self, hmac_key: &HmacKey) -> Result<BuiltBundle, Error> {
        let db_key =
            self.db_key.as_ref().ok_or_else(|| Error::DatabaseNotOpen(self.db_name.clone()))?;

        let compressed = self.snapshot().to_compressed()?;
        let ciphertext = aead::encrypt(db_key, &compressed);

        let keys =
            self.items_index.iter().map(|entry| item_key(hmac_key, &entry.item_id)).collect();

        Ok(BuiltBundle {
            seq_no: self.last_seq_no,
            bundle: bundle::to_base64(&ciphertext),
            keys,
        })
    }
}

/// Decrypt one wire transaction into a [`Mutation`].
fn decrypt_transaction(db_key: &AesKey, tx: &Transaction) -> Result<Mutation, Error> {
    let ops = match tx.command {
        Command::BatchTransaction => {
            let operations = tx.operations.as_deref().unwrap_or_default();
            operations
                .iter()
                .map(|op| decrypt_op(db_key, op.command, &op.item_id, op.record.as_deref()))
                .collect::<Result<Vec<_>, Error>>()?
        },
        command => {
            let item_id = tx
                .item_id
                .as_deref()
                .ok_or_else(|| Error::Proto(malformed("transaction missing itemId")))?;
            vec![decrypt_op(db_key, command, item_id, tx.record.as_deref())?]
        },
    };

    Ok(Mutation { seq_no: tx.seq_no, ops })
}

fn decrypt_op(
    db_key: &AesKey,
    command: Command,
    item_id: &str,
    record: Option<&str>,
) -> Result<Op, Error> {
    let item_id = item_id.to_string();
    match command {
        Command::Insert => Ok(Op::Insert { item_id, record: decrypt_record(db_key, record)? }),
        Command::Update => Ok(Op::Update { item_id, record: decrypt_record(db_key, record)? }),
        Command::Delete => Ok(Op::Delete { item_id }),
        Command::BatchTransaction => {
            Err(Error::Proto(malformed("nested batch transactions are not allowed")))
        },
    }
}

fn decrypt_record(db_key: &AesKey, record: Option<&str>) -> Result<Value, Error> {
    let encrypted = record.ok_or_else(|| Error::Proto(malformed("write missing record")))?;
    let ciphertext = bundle::from_base64(encrypted)?;
    let plaintext = aead::decrypt(db_key, &ciphertext)?;
    Ok(serde_json::from_slice(&plaintext).map_err(coffer_proto::ProtoError::from)?)
}

fn malformed(detail: &str) -> coffer_proto::ProtoError {
    coffer_proto::ProtoError::Envelope(detail.to_string())
}

/// Encrypt a plaintext record for an outbound write.
///
/// # Errors
///
/// A JSON error if the record cannot be serialized.
pub fn encrypt_record(db_key: &AesKey, record: &Value) -> Result<String, Error> {
    let plaintext = serde_json::to_vec(record).map_err(coffer_proto::ProtoError::from)?;
    Ok(bundle::to_base64(&aead::encrypt(db_key, &plaintext)))
}
