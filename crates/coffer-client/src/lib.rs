//! Tokio driver for the Coffer client.
//!
//! Bridges the sans-IO core in `coffer-core` to a real WebSocket: a single
//! driver task owns the connection state machine and the socket, executes
//! the core's actions, and completes caller futures when their requests
//! resolve. UI interactions (seed entry, fingerprint confirmations) are
//! injected through [`UiHandler`] and never block the event loop.

#![forbid(unsafe_code)]

pub mod client;
pub mod transport;

pub use client::{Client, ClientConfig, DatabaseInfo, DenyAllUi, UiHandler};
pub use coffer_core::{Error, ItemView, WriteOp};
pub use transport::{endpoint_url, TransportError};
