//! Coffer client core.
//!
//! The sans-IO heart of the client: the connection state machine, the
//! request/response multiplexer, the per-database replication engine, and
//! the access-grant subsystem. Methods take parsed messages and the current
//! time as input and return [`connection::Action`] lists for a driver to
//! execute; no I/O happens inside this crate, which keeps every protocol
//! path testable without a socket.
//!
//! # Trust model
//!
//! The server orders and stores the transaction log but can decrypt none of
//! it: records, database names, and bundles are AES-GCM ciphertext under
//! keys derived from the user's seed, and the only indices the server sees
//! are HMAC tags. The server may still reorder or withhold messages; the
//! sequence-number gating in [`database`] makes replay deterministic under
//! that assumption.

#![forbid(unsafe_code)]

pub mod access;
pub mod connection;
pub mod database;
pub mod error;
pub mod keys;
pub mod requests;
pub mod store;

pub use connection::{
    Action, Connection, ConnectionConfig, Phase, Submitted, WriteOp, CONNECT_TIMEOUT,
};
pub use database::{Database, ItemView};
pub use error::Error;
pub use keys::{KeySet, Salts, SeedRequestKeys, StoredSeedRequest};
pub use requests::REQUEST_TIMEOUT;
pub use store::{LocalStore, MemoryStore, StoreError};
