//! Request/response correlation.
//!
//! Every outbound action carries a fresh request id; the table below maps
//! ids to their pending state until a response arrives, the 10-second
//! deadline elapses, or the connection closes. An entry leaves the table
//! exactly once, which is what gives callers the at-most-once resolution
//! guarantee: late or duplicate responses find nothing and are discarded.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use coffer_proto::Action;

/// Deadline for any single request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a request was sent — either resolving a caller's future or driving
/// an internal protocol step.
#[derive(Debug, Clone, PartialEq)]
pub enum Purpose {
    /// Pass the response data straight to the caller awaiting `ticket`.
    Resolve {
        /// Id the driver's completion map is keyed by.
        ticket: String,
    },
    /// `OpenDatabase`; on 404 the core creates the database and retries.
    OpenDatabase {
        /// Database being opened (by name hash).
        db_name_hash: String,
        /// Original caller ticket, carried through the chain.
        ticket: String,
        /// Whether this open already followed a create; a second 404 is
        /// surfaced instead of looping.
        retried: bool,
    },
    /// `CreateDatabase` issued from the open chain.
    CreateDatabase {
        /// Database being created (by name hash).
        db_name_hash: String,
        /// Original caller ticket.
        ticket: String,
    },
    /// `FindDatabases`; names are decrypted before the caller sees them.
    FindDatabases {
        /// Caller ticket.
        ticket: String,
    },
    /// `ValidateKey`; success moves the connection to `Ready`, failure is
    /// fatal.
    ValidateKey,
    /// `RequestSeed`; an empty answer surfaces the manual-entry prompt.
    RequestSeed,
    /// `GetRequestsForSeed`; each listed requester is offered to the UI.
    GetRequestsForSeed,
    /// `SendSeed`; completion frees the per-peer handshake slot.
    SendSeed {
        /// sha256 of the requester's public key.
        peer_hash: [u8; 32],
    },
    /// `SignOut`; any outcome closes the connection.
    SignOut {
        /// Caller ticket.
        ticket: String,
    },
    /// `Bundle` upload for a database.
    Bundle {
        /// Database the snapshot belongs to.
        db_id: String,
    },
    /// `GetPublicKey` issued from the grant chain; the response feeds the
    /// UI confirmation.
    GetPublicKeyForGrant {
        /// Caller ticket.
        ticket: String,
        /// Database being granted (by name hash).
        db_name_hash: String,
        /// Grantee username.
        username: String,
        /// Whether the grant is read-only.
        read_only: bool,
    },
    /// `GetDatabaseAccessGrants`; grants are decrypted per entry.
    AccessGrants {
        /// Caller ticket.
        ticket: String,
    },
}

/// One in-flight request.
#[derive(Debug, Clone)]
pub struct Pending {
    /// The action that was sent.
    pub action: Action,
    /// Continuation for the response.
    pub purpose: Purpose,
    /// When the request went out; deadline base.
    pub sent_at: Instant,
}

/// The id → pending map plus the id allocator.
#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: u64,
    entries: HashMap<String, Pending>,
}

impl PendingRequests {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh request id, unique for this connection.
    pub fn next_request_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    /// Record an in-flight request.
    pub fn register(&mut self, request_id: String, action: Action, purpose: Purpose, now: Instant) {
        let previous =
            self.entries.insert(request_id, Pending { action, purpose, sent_at: now });
        debug_assert!(previous.is_none(), "request ids are never reused");
    }

    /// Take the pending entry for a response, if it is still outstanding.
    ///
    /// Returns `None` for unknown ids and for ids already resolved — the
    /// caller logs and discards those responses.
    pub fn resolve(&mut self, request_id: &str) -> Option<Pending> {
        self.entries.remove(request_id)
    }

    /// Remove and return every request past its deadline.
    pub fn expired(&mut self, now: Instant) -> Vec<(String, Pending)> {
        let overdue: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.sent_at) > REQUEST_TIMEOUT)
            .map(|(id, _)| id.clone())
            .collect();

        overdue
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|pending| (id, pending)))
            .collect()
    }

    /// Remove and return everything; used when the connection closes.
    pub fn drain(&mut self) -> Vec<(String, Pending)> {
        self.entries.drain().collect()
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
