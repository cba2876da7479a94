//! JSON wire protocol for the Coffer client.
//!
//! Both directions of the channel carry JSON objects. Outbound requests are
//! `{requestId, action, params}`; inbound messages are either responses
//! (`{requestId, response}`) correlated by id, or server-pushed events
//! (`{route, …}`).
//!
//! Inbound messages are modeled as a closed sum type: every known route is a
//! variant, and unknown routes are surfaced as [`ServerMessage::UnknownRoute`]
//! so the caller can log and ignore them rather than fail the connection.
//!
//! Encrypted fields travel base64-encoded. Bundles additionally pass through
//! DEFLATE before encryption; see [`bundle`].

pub mod bundle;
pub mod envelope;
pub mod error;
pub mod transaction;

pub use bundle::{BundleSnapshot, IndexEntry, SnapshotItem};
pub use envelope::{
    AcceptDatabaseAccessParams, Action, BatchTransactionParams, BatchWrite, BundleParams,
    CreateDatabaseParams, DatabaseAccessGrant, DeleteParams, GetDatabaseParams,
    GetPublicKeyParams, GrantDatabaseAccessParams, OpenDatabaseParams, Request, RequestParams,
    RequestSeedParams, Response, ResponseBody, SaltsWire, SendSeedParams, ServerEvent,
    ServerMessage, SignOutParams, ValidateKeyParams, WriteParams, NOT_FOUND_STATUS,
    SUCCESS_STATUS,
};
pub use error::ProtoError;
pub use transaction::{BatchOperation, Command, Transaction};
