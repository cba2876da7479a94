//! Transaction-log wire format.
//!
//! Each transaction carries a server-assigned sequence number; the log is
//! delivered ascending and replayed in order. Records arrive encrypted
//! under the database key; this crate only describes the shape, decryption
//! happens in the replication engine.

use serde::{Deserialize, Serialize};

/// Transaction commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Add a new item.
    Insert,
    /// Replace an existing item's record.
    Update,
    /// Remove an item.
    Delete,
    /// Ordered group of the above, atomic with respect to change
    /// notification.
    BatchTransaction,
}

/// One entry of the transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Server-assigned, monotonically increasing.
    pub seq_no: u64,
    /// What to do.
    pub command: Command,
    /// Target item; absent for batches.
    #[serde(default)]
    pub item_id: Option<String>,
    /// Encrypted record, base64-encoded; absent for deletes and batches.
    #[serde(default)]
    pub record: Option<String>,
    /// Batch contents; present only for `BatchTransaction`.
    #[serde(default)]
    pub operations: Option<Vec<BatchOperation>>,
}

/// One operation inside a batch transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    /// `Insert`, `Update`, or `Delete`.
    pub command: Command,
    /// Target item.
    pub item_id: String,
    /// Encrypted record, base64-encoded; absent for deletes.
    #[serde(default)]
    pub record: Option<String>,
}
