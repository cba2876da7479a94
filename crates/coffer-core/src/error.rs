//! Error taxonomy for the client core.
//!
//! Propagation policy:
//! - authentication failures while processing one of many grants or seed
//!   requests are isolated (logged, iteration continues);
//! - authentication failures during key validation or bundle decryption are
//!   fatal to the connection;
//! - request failures are surfaced to the originating caller;
//! - transport closure fails every pending request with [`Error::Disconnected`].

use coffer_crypto::CryptoError;
use coffer_proto::{Action, ProtoError};
use thiserror::Error;

/// Errors surfaced by the connection, the replication engine, and the
/// access-grant subsystem.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Connect or request deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// Underlying channel failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection closed while the request was outstanding.
    #[error("connection closed")]
    Disconnected,

    /// A second connect was attempted while one is live.
    #[error("a connection is already live")]
    AlreadyConnected,

    /// Cryptographic failure; `CryptoError::Authentication` inside means a
    /// tag mismatch or DH shared-key mismatch.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Server rejected the `ValidateKey` proof. Fatal for this connection.
    #[error("server rejected key validation")]
    KeyValidationFailed,

    /// Non-success response from the server.
    #[error("{action} failed with status {status}: {message}")]
    RequestFailed {
        /// The action that failed.
        action: Action,
        /// Server status code.
        status: u16,
        /// Server-provided description.
        message: String,
    },

    /// User dismissed the seed-entry prompt.
    #[error("seed entry canceled")]
    Canceled,

    /// Operation needs a seed that is not available yet.
    #[error("no seed available")]
    MissingSeed,

    /// Operation needs salts that have not arrived yet.
    #[error("salts not received")]
    MissingSalts,

    /// Mutation against a database that was never opened.
    #[error("database `{0}` is not open")]
    DatabaseNotOpen(String),

    /// Open of a database that is already open on this connection.
    #[error("database `{0}` is already open")]
    DatabaseAlreadyOpen(String),

    /// Operation not allowed in the connection's current state.
    #[error("invalid state for {0}")]
    InvalidState(&'static str),

    /// Wire-format failure.
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Local store failure.
    #[error("local store: {0}")]
    Store(String),
}

impl Error {
    /// Whether this error terminates the connection when it occurs inside
    /// the event loop (as opposed to being surfaced to one caller).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::KeyValidationFailed | Self::Crypto(CryptoError::Authentication))
    }
}
