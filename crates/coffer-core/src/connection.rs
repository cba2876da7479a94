//! Connection state machine.
//!
//! Owns exactly one transport session and everything scoped to it: the
//! derived key set, the pending-request table, and the open databases.
//! Sans-IO: inputs are parsed server messages, user operations, and time
//! ticks; outputs are [`Action`] lists the driver executes. No I/O happens
//! here, so every protocol path is testable without a socket.
//!
//! # State Machine
//!
//! ```text
//! ┌──────────────┐ connect ┌─────────┐ Connection event  ┌──────────┐
//! │ Disconnected │────────>│ Opening │──────────┬───────>│ HaveSeed │
//! └──────────────┘         └─────────┘ no seed  │  seed  └────┬─────┘
//!        ▲                      │               ▼             │ derive
//!        │                      │          ┌──────────┐       ▼
//!        │                      │ timeout  │ NeedSeed │  ┌─────────┐
//!        │                      │          └────┬─────┘  │ KeyInit │
//!        │                      │     seed recv │        └────┬────┘
//!        │                      │     or entry  └────────────>│ ValidateKey ok
//!        │                      ▼                             ▼
//!        │                 ┌────────┐                    ┌───────┐
//!        └─────────────────│ Closed │<───────────────────│ Ready │
//!            (any close)   └────────┘  sign-out / error  └───────┘
//! ```
//!
//! Entry into `Opening` starts a 10-second deadline; every request carries
//! its own 10-second deadline. On any close, all pending requests fail with
//! [`Error::Disconnected`], databases are dropped, and key material is
//! zeroized.

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use coffer_crypto::{aead, dh, hash, random};
use coffer_proto::{
    bundle, BatchWrite, BundleParams, CreateDatabaseParams, DatabaseAccessGrant, DeleteParams,
    GetDatabaseParams, GetPublicKeyParams, GrantDatabaseAccessParams, OpenDatabaseParams, Request,
    RequestParams, RequestSeedParams, Response, SaltsWire, SendSeedParams, ServerEvent,
    ServerMessage, SignOutParams, Transaction, ValidateKeyParams, WriteParams, NOT_FOUND_STATUS,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, warn};
use zeroize::Zeroizing;

use crate::{
    access::{self, GrantOffer},
    database::{self, encrypt_record, Database, ItemView},
    error::Error,
    keys::{KeySet, Salts, SeedRequestKeys},
    requests::{PendingRequests, Purpose},
    store::LocalStore,
};

/// Deadline for the transport handshake: the `Connection` event must arrive
/// within this long of `connect`.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// The server's DH public key. Defaults to the compiled-in deployment
    /// key; overridable for test harnesses that play the server.
    pub server_public_key: [u8; 32],
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self { server_public_key: dh::SERVER_PUBLIC_KEY }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No transport session.
    Disconnected,
    /// Transport handshake begun; waiting for the `Connection` event.
    Opening {
        /// When the handshake started; deadline base.
        since: Instant,
    },
    /// No local seed; the seed-request handshake is running.
    NeedSeed,
    /// Local seed present, keys not yet derived.
    HaveSeed,
    /// Keys derived, `ValidateKey` in flight.
    KeyInit,
    /// Steady state; all user actions allowed.
    Ready,
}

/// Outputs of the state machine, executed by the driver.
#[derive(Debug)]
pub enum Action {
    /// Serialize and send this request on the transport.
    SendRequest(Request),
    /// Complete the caller awaiting `request_id`.
    ResolveRequest {
        /// The ticket handed out when the operation was submitted.
        request_id: String,
        /// Response data on success.
        result: Result<Option<Value>, Error>,
    },
    /// A database changed; invoke its change subscriber.
    DatabaseChanged {
        /// Database name as the caller knows it.
        db_name: String,
        /// Items in insertion order.
        items: Vec<ItemView>,
    },
    /// No paired device answered; ask the user to enter the seed manually,
    /// showing this device's fingerprint for the other side to verify.
    PromptForSeed {
        /// Fingerprint of this device's ephemeral public key.
        device_fingerprint: String,
    },
    /// A device asked for the seed; ask the user to verify its fingerprint.
    ConfirmSeedSend {
        /// Token for `approve_seed_send` / `deny_seed_send`.
        token: u64,
        /// Fingerprint of the requesting device's public key.
        requester_fingerprint: String,
    },
    /// About to grant database access; ask the user to verify the grantee.
    ConfirmGrantSend {
        /// Token for `approve_grant_send` / `deny_grant_send`.
        token: u64,
        /// Fingerprint of the grantee's public key.
        grantee_fingerprint: String,
        /// Database being granted.
        db_name: String,
        /// Grantee username.
        username: String,
    },
    /// A grant is pending acceptance; ask the user to verify the owner.
    ConfirmGrantAccept {
        /// Token for `approve_grant_accept` / `deny_grant_accept`.
        token: u64,
        /// Decrypted database name.
        db_name: String,
        /// Fingerprint of the owner's public key.
        owner_fingerprint: String,
        /// Whether the grant is read-only.
        read_only: bool,
    },
    /// Key validation succeeded; the connection is usable.
    ConnectionReady,
    /// The connection is closed; the driver tears down the transport.
    Close {
        /// The terminating error, if the close was not requested.
        error: Option<Error>,
    },
}

/// A submitted operation: the ticket the caller awaits plus the actions to
/// execute.
#[derive(Debug)]
pub struct Submitted {
    /// Id under which the operation resolves.
    pub ticket: String,
    /// Actions for the driver.
    pub actions: Vec<Action>,
}

/// A single client-side write, used for batch transactions.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a new item.
    Insert {
        /// Caller-supplied item id.
        item_id: String,
        /// Plaintext record.
        record: Value,
    },
    /// Replace an item's record.
    Update {
        /// Caller-supplied item id.
        item_id: String,
        /// Plaintext record.
        record: Value,
    },
    /// Remove an item.
    Delete {
        /// Caller-supplied item id.
        item_id: String,
    },
}

/// In-flight grant offer awaiting the grantee public key and confirmation.
struct GrantSend {
    ticket: String,
    db_name_hash: String,
    db_name: String,
    username: String,
    read_only: bool,
    grantee_public: [u8; 32],
}

/// The connection state machine. One per transport session.
pub struct Connection<S: LocalStore> {
    config: ConnectionConfig,
    username: String,
    session_id: String,
    store: S,
    phase: Phase,
    salts: Option<Salts>,
    validation_message: Option<Vec<u8>>,
    seed: Option<Zeroizing<Vec<u8>>>,
    keys: Option<KeySet>,
    seed_request: Option<SeedRequestKeys>,
    pending: PendingRequests,
    databases: HashMap<String, Database>,
    db_id_to_hash: HashMap<String, String>,
    /// sha256 of requester public keys with a send already confirmed or in
    /// flight; at most one handshake per peer key.
    seed_sends: HashSet<[u8; 32]>,
    pending_seed_confirms: HashMap<u64, [u8; 32]>,
    pending_grant_sends: HashMap<u64, GrantSend>,
    pending_grant_offers: HashMap<u64, GrantOffer>,
    next_token: u64,
}

impl<S: LocalStore> Connection<S> {
    /// Create a connection in `Disconnected`.
    pub fn new(config: ConnectionConfig, username: String, session_id: String, store: S) -> Self {
        Self {
            config,
            username,
            session_id,
            store,
            phase: Phase::Disconnected,
            salts: None,
            validation_message: None,
            seed: None,
            keys: None,
            seed_request: None,
            pending: PendingRequests::new(),
            databases: HashMap::new(),
            db_id_to_hash: HashMap::new(),
            seed_sends: HashSet::new(),
            pending_seed_confirms: HashMap::new(),
            pending_grant_sends: HashMap::new(),
            pending_grant_offers: HashMap::new(),
            next_token: 0,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Session id this connection authenticates as.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Begin the handshake: `Disconnected` → `Opening`.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyConnected`] in any other state.
    pub fn connect(&mut self, now: Instant) -> Result<(), Error> {
        if self.phase != Phase::Disconnected {
            return Err(Error::AlreadyConnected);
        }
        self.phase = Phase::Opening { since: now };
        Ok(())
    }

    // ── Inbound dispatch ────────────────────────────────────────────────

    /// Process one inbound message.
    ///
    /// Fatal errors (key validation, bundle decryption) close the
    /// connection; isolated errors are logged and dropped.
    pub fn handle_message(&mut self, message: ServerMessage, now: Instant) -> Vec<Action> {
        match message {
            ServerMessage::UnknownRoute(route) => {
                warn!(%route, "ignoring event with unknown route");
                vec![]
            },
            ServerMessage::Response(response) => self.handle_response(response, now),
            ServerMessage::Event(event) => {
                let result = match event {
                    ServerEvent::Connection { salts, encrypted_validation_message } => {
                        self.on_connection_event(&salts, &encrypted_validation_message, now)
                    },
                    ServerEvent::ApplyTransactions {
                        db_id,
                        db_name_hash,
                        db_key,
                        bundle,
                        bundle_seq_no,
                        transaction_log,
                    } => self.on_apply_transactions(
                        db_id,
                        db_name_hash,
                        db_key.as_deref(),
                        bundle.as_deref(),
                        bundle_seq_no,
                        &transaction_log,
                    ),
                    ServerEvent::BuildBundle { db_id } => self.on_build_bundle(&db_id, now),
                    ServerEvent::ReceiveRequestForSeed { requester_public_key } => {
                        Ok(self.on_seed_request(&requester_public_key))
                    },
                    ServerEvent::ReceiveSeed { encrypted_seed, sender_public_key } => {
                        self.on_receive_seed(&encrypted_seed, &sender_public_key, now)
                    },
                };

                match result {
                    Ok(actions) => actions,
                    Err(err) if err.is_fatal() => {
                        error!(%err, "fatal error while handling server event");
                        self.close(Some(err))
                    },
                    Err(err) => {
                        warn!(%err, "ignoring malformed server event");
                        vec![]
                    },
                }
            },
        }
    }

    /// The transport reported a failure; close everything.
    pub fn transport_failed(&mut self, reason: String) -> Vec<Action> {
        self.close(Some(Error::Transport(reason)))
    }

    /// Periodic maintenance: the connect deadline and request deadlines.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        if let Phase::Opening { since } = self.phase {
            if now.duration_since(since) > CONNECT_TIMEOUT {
                warn!("connection handshake timed out");
                return self.close(Some(Error::Timeout));
            }
        }

        let mut actions = Vec::new();
        for (id, pending) in self.pending.expired(now) {
            warn!(request_id = %id, action = %pending.action, "request timed out");
            match pending.purpose {
                Purpose::Resolve { ticket } | Purpose::SignOut { ticket } => {
                    actions.push(Action::ResolveRequest {
                        request_id: ticket,
                        result: Err(Error::Timeout),
                    });
                },
                Purpose::OpenDatabase { db_name_hash, ticket, .. }
                | Purpose::CreateDatabase { db_name_hash, ticket } => {
                    self.discard_unopened_database(&db_name_hash);
                    actions.push(Action::ResolveRequest {
                        request_id: ticket,
                        result: Err(Error::Timeout),
                    });
                },
                Purpose::FindDatabases { ticket }
                | Purpose::AccessGrants { ticket }
                | Purpose::GetPublicKeyForGrant { ticket, .. } => {
                    actions.push(Action::ResolveRequest {
                        request_id: ticket,
                        result: Err(Error::Timeout),
                    });
                },
                Purpose::ValidateKey => {
                    // Without validation the connection is unusable.
                    actions.extend(self.close(Some(Error::Timeout)));
                    return actions;
                },
                Purpose::RequestSeed => {
                    // No paired device answered in time; fall back to
                    // manual entry.
                    if let Some(request) = &self.seed_request {
                        actions.push(Action::PromptForSeed {
                            device_fingerprint: request.fingerprint(),
                        });
                    }
                },
                Purpose::SendSeed { peer_hash } => {
                    self.seed_sends.remove(&peer_hash);
                },
                Purpose::GetRequestsForSeed | Purpose::Bundle { .. } => {},
            }
        }
        actions
    }

    /// Close the connection, failing all pending requests and zeroizing key
    /// material. Safe to call in any state.
    pub fn close(&mut self, error: Option<Error>) -> Vec<Action> {
        let mut actions = Vec::new();

        for (_, pending) in self.pending.drain() {
            if let Some(ticket) = ticket_of(&pending.purpose) {
                actions.push(Action::ResolveRequest {
                    request_id: ticket.to_string(),
                    result: Err(Error::Disconnected),
                });
            }
        }

        // Dropping the key set and seed zeroizes them.
        self.keys = None;
        self.seed = None;
        self.validation_message = None;
        self.salts = None;
        self.seed_request = None;
        self.databases.clear();
        self.db_id_to_hash.clear();
        self.seed_sends.clear();
        self.pending_seed_confirms.clear();
        self.pending_grant_sends.clear();
        self.pending_grant_offers.clear();
        self.phase = Phase::Disconnected;

        actions.push(Action::Close { error });
        actions
    }

    // ── Connection establishment and key validation ─────────────────────

    fn on_connection_event(
        &mut self,
        salts_wire: &SaltsWire,
        validation_b64: &str,
        now: Instant,
    ) -> Result<Vec<Action>, Error> {
        if !matches!(self.phase, Phase::Opening { .. }) {
            debug!("duplicate Connection event ignored");
            return Ok(vec![]);
        }

        self.salts = Some(Salts::from_wire(salts_wire)?);
        self.validation_message = Some(bundle::from_base64(validation_b64)?);

        let stored_seed =
            self.store.get_seed(&self.username).map_err(|e| Error::Store(e.to_string()))?;

        match stored_seed {
            Some(seed_b64) => {
                self.phase = Phase::HaveSeed;
                let seed = Zeroizing::new(bundle::from_base64(&seed_b64)?);
                self.set_keys(seed, now)
            },
            None => {
                self.phase = Phase::NeedSeed;
                self.begin_seed_request(now)
            },
        }
    }

    /// Derive the key set and start validation: `{HaveSeed, NeedSeed}` →
    /// `KeyInit`.
    fn set_keys(&mut self, seed: Zeroizing<Vec<u8>>, now: Instant) -> Result<Vec<Action>, Error> {
        let salts = self.salts.as_ref().ok_or(Error::MissingSalts)?;
        let keys = KeySet::derive(&seed, salts)?;

        let shared = dh::shared_key(&keys.dh, &self.config.server_public_key)?;
        let validation = self
            .validation_message
            .as_ref()
            .ok_or(Error::MissingSalts)?;
        // Failing to open the validation message means the derived DH key is
        // wrong, which is fatal for this connection.
        let nonce = aead::decrypt(&shared, validation)?;

        self.seed = Some(seed);
        self.keys = Some(keys);
        self.phase = Phase::KeyInit;

        let params = RequestParams::ValidateKey(ValidateKeyParams {
            validation_message: bundle::to_base64(&nonce),
        });
        Ok(vec![self.send(params, |_| Purpose::ValidateKey, now)])
    }

    fn on_validate_key_resolved(
        &mut self,
        outcome: Result<Option<Value>, Error>,
        now: Instant,
    ) -> Vec<Action> {
        match outcome {
            Ok(_) => {
                self.phase = Phase::Ready;
                let fetch = self.send(
                    RequestParams::GetRequestsForSeed,
                    |_| Purpose::GetRequestsForSeed,
                    now,
                );
                vec![Action::ConnectionReady, fetch]
            },
            Err(err) => {
                error!(%err, "server rejected key validation");
                self.close(Some(Error::KeyValidationFailed))
            },
        }
    }

    // ── Seed handshake ──────────────────────────────────────────────────

    fn begin_seed_request(&mut self, now: Instant) -> Result<Vec<Action>, Error> {
        let stored =
            self.store.get_seed_request(&self.username).map_err(|e| Error::Store(e.to_string()))?;

        let request = match stored {
            Some(stored) => match SeedRequestKeys::from_stored(&stored) {
                Ok(request) => request,
                Err(err) => {
                    warn!(%err, "stored seed request unusable, generating a fresh one");
                    self.fresh_seed_request()?
                },
            },
            None => self.fresh_seed_request()?,
        };

        let public_b64 = bundle::to_base64(request.public());
        self.seed_request = Some(request);

        let params =
            RequestParams::RequestSeed(RequestSeedParams { requester_public_key: public_b64 });
        Ok(vec![self.send(params, |_| Purpose::RequestSeed, now)])
    }

    fn fresh_seed_request(&mut self) -> Result<SeedRequestKeys, Error> {
        let request = SeedRequestKeys::generate();
        self.store
            .set_seed_request(&self.username, &request.to_stored())
            .map_err(|e| Error::Store(e.to_string()))?;
        Ok(request)
    }

    fn on_request_seed_resolved(
        &mut self,
        outcome: Result<Option<Value>, Error>,
        now: Instant,
    ) -> Vec<Action> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SeedDelivery {
            encrypted_seed: String,
            sender_public_key: String,
        }

        if let Ok(Some(data)) = &outcome {
            if let Ok(delivery) = serde_json::from_value::<SeedDelivery>(data.clone()) {
                return match self.on_receive_seed(
                    &delivery.encrypted_seed,
                    &delivery.sender_public_key,
                    now,
                ) {
                    Ok(actions) => actions,
                    Err(err) => {
                        warn!(%err, "seed delivery could not be decrypted");
                        self.prompt_for_seed()
                    },
                };
            }
        }

        if let Err(err) = &outcome {
            warn!(%err, "seed request failed");
        }
        // No paired device holds the seed ready; offer manual entry with the
        // device fingerprint the other side must verify.
        self.prompt_for_seed()
    }

    fn prompt_for_seed(&self) -> Vec<Action> {
        match &self.seed_request {
            Some(request) => {
                vec![Action::PromptForSeed { device_fingerprint: request.fingerprint() }]
            },
            None => vec![],
        }
    }

    fn on_receive_seed(
        &mut self,
        encrypted_seed: &str,
        sender_public_b64: &str,
        now: Instant,
    ) -> Result<Vec<Action>, Error> {
        if self.phase != Phase::NeedSeed {
            debug!("seed delivery in phase {:?} ignored", self.phase);
            return Ok(vec![]);
        }
        let request = self.seed_request.as_ref().ok_or(Error::MissingSeed)?;

        let sender_public = hash::to_32(&bundle::from_base64(sender_public_b64)?)?;
        let seed = match access::decrypt_seed(request.secret(), &sender_public, encrypted_seed) {
            Ok(seed) => seed,
            Err(err) => {
                // A mismatched sender must not kill the handshake; another
                // device may still answer.
                warn!(%err, "discarding seed delivery that failed authentication");
                return Ok(vec![]);
            },
        };

        self.adopt_seed(seed, now)
    }

    /// Persist a newly acquired seed and continue to key validation.
    fn adopt_seed(
        &mut self,
        seed: Zeroizing<Vec<u8>>,
        now: Instant,
    ) -> Result<Vec<Action>, Error> {
        self.store
            .save_seed(&self.username, &bundle::to_base64(&seed))
            .map_err(|e| Error::Store(e.to_string()))?;
        self.store
            .remove_seed_request(&self.username)
            .map_err(|e| Error::Store(e.to_string()))?;
        self.seed_request = None;

        self.set_keys(seed, now)
    }

    /// The user typed the seed at the prompt.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] outside `NeedSeed`, [`Error::Proto`] on
    /// malformed base64, `CryptoError::WeakSeed` for short seeds. Rejected
    /// input leaves the connection state untouched.
    pub fn provide_seed(&mut self, seed_b64: &str, now: Instant) -> Result<Vec<Action>, Error> {
        if self.phase != Phase::NeedSeed {
            return Err(Error::InvalidState("provide_seed"));
        }
        let seed = Zeroizing::new(bundle::from_base64(seed_b64.trim())?);
        if seed.len() < coffer_crypto::derivation::MIN_SEED_LEN {
            return Err(Error::Crypto(coffer_crypto::CryptoError::WeakSeed { len: seed.len() }));
        }
        self.adopt_seed(seed, now)
    }

    /// The user dismissed the seed prompt: sign out.
    pub fn cancel_seed_entry(&mut self) -> Vec<Action> {
        if let Err(err) = self.store.sign_out_session(&self.username) {
            warn!(%err, "failed to clear local session");
        }

        // Best-effort sign-out on the wire, then close carrying `Canceled`
        // so the waiting caller learns why.
        let request = Request {
            request_id: self.pending.next_request_id(),
            params: RequestParams::SignOut(SignOutParams {
                session_id: self.session_id.clone(),
            }),
        };

        let mut actions = vec![Action::SendRequest(request)];
        actions.extend(self.close(Some(Error::Canceled)));
        actions
    }

    fn on_seed_request(&mut self, requester_public_b64: &str) -> Vec<Action> {
        if self.keys.is_none() {
            debug!("seed request before keys are initialized, ignoring");
            return vec![];
        }

        let requester_public = match bundle::from_base64(requester_public_b64)
            .map_err(Error::from)
            .and_then(|bytes| hash::to_32(&bytes).map_err(Error::from))
        {
            Ok(key) => key,
            Err(err) => {
                warn!(%err, "discarding malformed seed request");
                return vec![];
            },
        };

        let peer_hash = hash::sha256(&requester_public);
        if !self.seed_sends.insert(peer_hash) {
            debug!("seed handshake for this peer already in flight");
            return vec![];
        }

        let token = self.allocate_token();
        self.pending_seed_confirms.insert(token, requester_public);

        vec![Action::ConfirmSeedSend {
            token,
            requester_fingerprint: hash::fingerprint(&requester_public),
        }]
    }

    /// The user verified the requesting device's fingerprint.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] for an unknown token, [`Error::MissingSeed`]
    /// if no seed is held.
    pub fn approve_seed_send(&mut self, token: u64, now: Instant) -> Result<Vec<Action>, Error> {
        let requester_public = self
            .pending_seed_confirms
            .remove(&token)
            .ok_or(Error::InvalidState("approve_seed_send"))?;
        let keys = self.keys.as_ref().ok_or(Error::MissingSeed)?;
        let seed = self.seed.as_ref().ok_or(Error::MissingSeed)?;

        let encrypted_seed = access::encrypt_seed(&keys.dh, &requester_public, seed)?;
        let peer_hash = hash::sha256(&requester_public);

        let params = RequestParams::SendSeed(SendSeedParams {
            requester_public_key: bundle::to_base64(&requester_public),
            encrypted_seed,
        });
        Ok(vec![self.send(params, move |_| Purpose::SendSeed { peer_hash }, now)])
    }

    /// The user rejected the requesting device.
    pub fn deny_seed_send(&mut self, token: u64) {
        if let Some(requester_public) = self.pending_seed_confirms.remove(&token) {
            self.seed_sends.remove(&hash::sha256(&requester_public));
        }
    }

    fn on_seed_requests_listed(&mut self, outcome: Result<Option<Value>, Error>) -> Vec<Action> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Listed {
            #[serde(default)]
            seed_requests: Vec<ListedRequest>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ListedRequest {
            requester_public_key: String,
        }

        let data = match outcome {
            Ok(Some(data)) => data,
            Ok(None) => return vec![],
            Err(err) => {
                warn!(%err, "could not list queued seed requests");
                return vec![];
            },
        };

        match serde_json::from_value::<Listed>(data) {
            Ok(listed) => listed
                .seed_requests
                .iter()
                .flat_map(|request| self.on_seed_request(&request.requester_public_key))
                .collect(),
            Err(err) => {
                warn!(%err, "malformed seed request listing");
                vec![]
            },
        }
    }

    // ── Databases ───────────────────────────────────────────────────────

    /// Open (and create if missing) a database by name.
    ///
    /// The replica becomes usable when the server's first
    /// `ApplyTransactions` push lands; the ticket resolves when the open is
    /// acknowledged.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] before `Ready`,
    /// [`Error::DatabaseAlreadyOpen`] for a second open of the same name.
    pub fn open_database(&mut self, db_name: &str, now: Instant) -> Result<Submitted, Error> {
        self.require_ready()?;
        let keys = self.require_keys()?;

        let db_name_hash = database::db_name_hash(&keys.hmac, db_name);
        if self.databases.contains_key(&db_name_hash) {
            return Err(Error::DatabaseAlreadyOpen(db_name.to_string()));
        }
        self.databases
            .insert(db_name_hash.clone(), Database::new(db_name.to_string(), db_name_hash.clone()));

        let params =
            RequestParams::OpenDatabase(OpenDatabaseParams { db_name_hash: db_name_hash.clone() });
        Ok(self.submit(params, move |ticket| Purpose::OpenDatabase {
            db_name_hash,
            ticket,
            retried: false,
        }, now))
    }

    fn on_open_database_resolved(
        &mut self,
        db_name_hash: String,
        ticket: String,
        retried: bool,
        outcome: Result<Option<Value>, Error>,
        now: Instant,
    ) -> Vec<Action> {
        match outcome {
            Ok(data) => {
                vec![Action::ResolveRequest { request_id: ticket, result: Ok(data) }]
            },
            Err(Error::RequestFailed { status, .. }) if status == NOT_FOUND_STATUS && !retried => {
                // First open of a new database: create it, then try again.
                let Some(db) = self.databases.get(&db_name_hash) else {
                    return vec![Action::ResolveRequest {
                        request_id: ticket,
                        result: Err(Error::DatabaseNotOpen(db_name_hash)),
                    }];
                };
                let db_name = db.name().to_string();

                let db_key = random::generate_key();
                let encryption_key = match self.require_keys() {
                    Ok(keys) => &keys.encryption,
                    Err(err) => {
                        return vec![Action::ResolveRequest {
                            request_id: ticket,
                            result: Err(err),
                        }];
                    },
                };

                let params = RequestParams::CreateDatabase(CreateDatabaseParams {
                    db_name_hash: db_name_hash.clone(),
                    encrypted_db_name: access::encrypt_db_name(&db_key, &db_name),
                    encrypted_db_key: access::wrap_db_key(encryption_key, &db_key),
                });
                let hash_for_purpose = db_name_hash;
                vec![self.send(
                    params,
                    move |_| Purpose::CreateDatabase { db_name_hash: hash_for_purpose, ticket },
                    now,
                )]
            },
            Err(err) => {
                self.discard_unopened_database(&db_name_hash);
                vec![Action::ResolveRequest { request_id: ticket, result: Err(err) }]
            },
        }
    }

    fn on_create_database_resolved(
        &mut self,
        db_name_hash: String,
        ticket: String,
        outcome: Result<Option<Value>, Error>,
        now: Instant,
    ) -> Vec<Action> {
        match outcome {
            Ok(_) => {
                let params = RequestParams::OpenDatabase(OpenDatabaseParams {
                    db_name_hash: db_name_hash.clone(),
                });
                vec![self.send(
                    params,
                    move |_| Purpose::OpenDatabase { db_name_hash, ticket, retried: true },
                    now,
                )]
            },
            Err(err) => {
                self.discard_unopened_database(&db_name_hash);
                vec![Action::ResolveRequest { request_id: ticket, result: Err(err) }]
            },
        }
    }

    fn discard_unopened_database(&mut self, db_name_hash: &str) {
        if let Some(db) = self.databases.get(db_name_hash) {
            if !db.is_init() {
                self.databases.remove(db_name_hash);
            }
        }
    }

    /// Fetch one database's metadata by name.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] before `Ready`.
    pub fn get_database(&mut self, db_name: &str, now: Instant) -> Result<Submitted, Error> {
        self.require_ready()?;
        let keys = self.require_keys()?;
        let params = RequestParams::GetDatabase(GetDatabaseParams {
            db_name_hash: database::db_name_hash(&keys.hmac, db_name),
        });
        Ok(self.submit_resolving(params, now))
    }

    /// Enumerate this user's databases; names are decrypted before the
    /// caller sees them.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] before `Ready`.
    pub fn find_databases(&mut self, now: Instant) -> Result<Submitted, Error> {
        self.require_ready()?;
        Ok(self.submit(RequestParams::FindDatabases, |ticket| Purpose::FindDatabases { ticket }, now))
    }

    fn on_find_databases_resolved(
        &mut self,
        ticket: String,
        outcome: Result<Option<Value>, Error>,
    ) -> Vec<Action> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Listing {
            #[serde(default)]
            databases: Vec<ListedDatabase>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ListedDatabase {
            db_id: String,
            db_name_hash: String,
            encrypted_db_key: String,
            encrypted_db_name: String,
        }

        let result = outcome.and_then(|data| {
            let keys = self.require_keys()?;
            let listing: Listing =
                serde_json::from_value(data.unwrap_or_else(|| json!({})))
                    .map_err(coffer_proto::ProtoError::from)?;

            let mut databases = Vec::new();
            for entry in listing.databases {
                // One undecryptable entry must not hide the others.
                let decrypted = access::unwrap_db_key(&keys.encryption, &entry.encrypted_db_key)
                    .and_then(|db_key| access::decrypt_db_name(&db_key, &entry.encrypted_db_name));
                match decrypted {
                    Ok(db_name) => databases.push(json!({
                        "dbName": db_name,
                        "dbId": entry.db_id,
                        "dbNameHash": entry.db_name_hash,
                    })),
                    Err(err) => {
                        warn!(%err, db_id = %entry.db_id, "skipping undecryptable database entry");
                    },
                }
            }
            Ok(Some(json!({ "databases": databases })))
        });

        vec![Action::ResolveRequest { request_id: ticket, result }]
    }

    /// Insert one item.
    ///
    /// The local replica is not touched: the server orders the transaction
    /// and the resulting `ApplyTransactions` push performs the update.
    ///
    /// # Errors
    ///
    /// [`Error::DatabaseNotOpen`] if the database is not open and
    /// initialized on this connection.
    pub fn insert(
        &mut self,
        db_name: &str,
        item_id: &str,
        record: &Value,
        now: Instant,
    ) -> Result<Submitted, Error> {
        let (db_id, item_key, encrypted_record) =
            self.prepare_write(db_name, item_id, Some(record))?;
        let params = RequestParams::Insert(WriteParams {
            db_id,
            item_key,
            encrypted_record: encrypted_record.unwrap_or_default(),
        });
        Ok(self.submit_resolving(params, now))
    }

    /// Update one item.
    ///
    /// # Errors
    ///
    /// See [`Connection::insert`].
    pub fn update(
        &mut self,
        db_name: &str,
        item_id: &str,
        record: &Value,
        now: Instant,
    ) -> Result<Submitted, Error> {
        let (db_id, item_key, encrypted_record) =
            self.prepare_write(db_name, item_id, Some(record))?;
        let params = RequestParams::Update(WriteParams {
            db_id,
            item_key,
            encrypted_record: encrypted_record.unwrap_or_default(),
        });
        Ok(self.submit_resolving(params, now))
    }

    /// Delete one item.
    ///
    /// # Errors
    ///
    /// See [`Connection::insert`].
    pub fn delete(&mut self, db_name: &str, item_id: &str, now: Instant) -> Result<Submitted, Error> {
        let (db_id, item_key, _) = self.prepare_write(db_name, item_id, None)?;
        let params = RequestParams::Delete(DeleteParams { db_id, item_key });
        Ok(self.submit_resolving(params, now))
    }

    /// Apply an ordered group of writes atomically.
    ///
    /// # Errors
    ///
    /// See [`Connection::insert`].
    pub fn batch_transaction(
        &mut self,
        db_name: &str,
        ops: Vec<WriteOp>,
        now: Instant,
    ) -> Result<Submitted, Error> {
        self.require_ready()?;
        let keys = self.require_keys()?;
        let db_name_hash = database::db_name_hash(&keys.hmac, db_name);
        let db = self
            .databases
            .get(&db_name_hash)
            .filter(|db| db.is_init())
            .ok_or_else(|| Error::DatabaseNotOpen(db_name.to_string()))?;
        let db_id =
            db.id().ok_or_else(|| Error::DatabaseNotOpen(db_name.to_string()))?.to_string();
        let db_key = db.key().ok_or_else(|| Error::DatabaseNotOpen(db_name.to_string()))?;

        let mut operations = Vec::with_capacity(ops.len());
        for op in ops {
            operations.push(match op {
                WriteOp::Insert { item_id, record } => BatchWrite {
                    command: coffer_proto::Command::Insert,
                    item_key: database::item_key(&keys.hmac, &item_id),
                    encrypted_record: Some(encrypt_record(db_key, &record)?),
                },
                WriteOp::Update { item_id, record } => BatchWrite {
                    command: coffer_proto::Command::Update,
                    item_key: database::item_key(&keys.hmac, &item_id),
                    encrypted_record: Some(encrypt_record(db_key, &record)?),
                },
                WriteOp::Delete { item_id } => BatchWrite {
                    command: coffer_proto::Command::Delete,
                    item_key: database::item_key(&keys.hmac, &item_id),
                    encrypted_record: None,
                },
            });
        }

        let params = RequestParams::BatchTransaction(coffer_proto::BatchTransactionParams {
            db_id,
            operations,
        });
        Ok(self.submit_resolving(params, now))
    }

    fn prepare_write(
        &mut self,
        db_name: &str,
        item_id: &str,
        record: Option<&Value>,
    ) -> Result<(String, String, Option<String>), Error> {
        self.require_ready()?;
        let keys = self.require_keys()?;
        let db_name_hash = database::db_name_hash(&keys.hmac, db_name);

        let db = self
            .databases
            .get(&db_name_hash)
            .filter(|db| db.is_init())
            .ok_or_else(|| Error::DatabaseNotOpen(db_name.to_string()))?;
        let db_id =
            db.id().ok_or_else(|| Error::DatabaseNotOpen(db_name.to_string()))?.to_string();

        let encrypted_record = match record {
            Some(record) => {
                let db_key =
                    db.key().ok_or_else(|| Error::DatabaseNotOpen(db_name.to_string()))?;
                Some(encrypt_record(db_key, record)?)
            },
            None => None,
        };

        Ok((db_id, database::item_key(&keys.hmac, item_id), encrypted_record))
    }

    fn on_apply_transactions(
        &mut self,
        db_id: String,
        db_name_hash: Option<String>,
        wrapped_db_key: Option<&str>,
        wire_bundle: Option<&str>,
        bundle_seq_no: Option<u64>,
        transaction_log: &[Transaction],
    ) -> Result<Vec<Action>, Error> {
        let db_name_hash = match db_name_hash {
            Some(hash) => hash,
            None => match self.db_id_to_hash.get(&db_id) {
                Some(hash) => hash.clone(),
                None => {
                    // First push always carries the hash inline; a push for
                    // an id we never opened is dropped on the floor.
                    debug!(%db_id, "transactions for unknown database ignored");
                    return Ok(vec![]);
                },
            },
        };

        let Some(db) = self.databases.get_mut(&db_name_hash) else {
            debug!(%db_id, "transactions for a database that is not open, ignoring");
            return Ok(vec![]);
        };

        if let Some(wrapped) = wrapped_db_key {
            let keys = self.keys.as_ref().ok_or(Error::MissingSeed)?;
            let db_key = access::unwrap_db_key(&keys.encryption, wrapped)?;
            db.set_key(db_key);
        }

        if let Some(wire_bundle) = wire_bundle {
            db.apply_encrypted_bundle(wire_bundle, bundle_seq_no.unwrap_or(0))?;
        }

        let mutations = db.decrypt_log(transaction_log)?;
        db.apply_mutations(mutations);

        if !db.is_init() {
            db.set_id(db_id.clone());
            db.mark_init();
            self.db_id_to_hash.insert(db_id, db_name_hash.clone());
        }

        Ok(vec![Action::DatabaseChanged {
            db_name: db.name().to_string(),
            items: db.item_views(),
        }])
    }

    fn on_build_bundle(&mut self, db_id: &str, now: Instant) -> Result<Vec<Action>, Error> {
        let Some(db_name_hash) = self.db_id_to_hash.get(db_id) else {
            debug!(%db_id, "bundle request for unknown database ignored");
            return Ok(vec![]);
        };
        let keys = self.keys.as_ref().ok_or(Error::MissingSeed)?;
        let Some(db) = self.databases.get(db_name_hash) else {
            return Ok(vec![]);
        };

        let built = db.build_bundle(&keys.hmac)?;
        let params = RequestParams::Bundle(BundleParams {
            db_id: db_id.to_string(),
            seq_no: built.seq_no,
            bundle: built.bundle,
            keys: built.keys,
        });
        let db_id = db_id.to_string();
        Ok(vec![self.send(params, move |_| Purpose::Bundle { db_id }, now)])
    }

    // ── Access grants ───────────────────────────────────────────────────

    /// Offer a database to another user. Fetches the grantee's public key,
    /// then surfaces a fingerprint confirmation before anything is sent.
    ///
    /// # Errors
    ///
    /// [`Error::DatabaseNotOpen`] if the database is not open on this
    /// connection (its key is needed for wrapping).
    pub fn grant_database_access(
        &mut self,
        db_name: &str,
        username: &str,
        read_only: bool,
        now: Instant,
    ) -> Result<Submitted, Error> {
        self.require_ready()?;
        let keys = self.require_keys()?;
        let db_name_hash = database::db_name_hash(&keys.hmac, db_name);
        if !self.databases.get(&db_name_hash).is_some_and(|db| db.key().is_some()) {
            return Err(Error::DatabaseNotOpen(db_name.to_string()));
        }

        let params =
            RequestParams::GetPublicKey(GetPublicKeyParams { username: username.to_string() });
        let username = username.to_string();
        Ok(self.submit(params, move |ticket| Purpose::GetPublicKeyForGrant {
            ticket,
            db_name_hash,
            username,
            read_only,
        }, now))
    }

    fn on_grantee_public_key(
        &mut self,
        ticket: String,
        db_name_hash: String,
        username: String,
        read_only: bool,
        outcome: Result<Option<Value>, Error>,
    ) -> Vec<Action> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PublicKeyData {
            public_key: String,
        }

        let grantee_public = match outcome.and_then(|data| {
            let data: PublicKeyData =
                serde_json::from_value(data.unwrap_or_else(|| json!({})))
                    .map_err(coffer_proto::ProtoError::from)?;
            let bytes = bundle::from_base64(&data.public_key)?;
            Ok(hash::to_32(&bytes)?)
        }) {
            Ok(key) => key,
            Err(err) => {
                return vec![Action::ResolveRequest { request_id: ticket, result: Err(err) }];
            },
        };

        let db_name = match self.databases.get(&db_name_hash) {
            Some(db) => db.name().to_string(),
            None => {
                return vec![Action::ResolveRequest {
                    request_id: ticket,
                    result: Err(Error::DatabaseNotOpen(db_name_hash)),
                }];
            },
        };

        let token = self.allocate_token();
        let action = Action::ConfirmGrantSend {
            token,
            grantee_fingerprint: hash::fingerprint(&grantee_public),
            db_name: db_name.clone(),
            username: username.clone(),
        };
        self.pending_grant_sends.insert(token, GrantSend {
            ticket,
            db_name,
            db_name_hash,
            username,
            read_only,
            grantee_public,
        });

        vec![action]
    }

    /// The user verified the grantee's fingerprint; transmit the grant.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] for an unknown token.
    pub fn approve_grant_send(&mut self, token: u64, now: Instant) -> Result<Vec<Action>, Error> {
        let grant = self
            .pending_grant_sends
            .remove(&token)
            .ok_or(Error::InvalidState("approve_grant_send"))?;

        let Some(db) = self.databases.get(&grant.db_name_hash) else {
            return Ok(vec![Action::ResolveRequest {
                request_id: grant.ticket,
                result: Err(Error::DatabaseNotOpen(grant.db_name)),
            }]);
        };
        let Some(db_key) = db.key() else {
            return Ok(vec![Action::ResolveRequest {
                request_id: grant.ticket,
                result: Err(Error::DatabaseNotOpen(grant.db_name)),
            }]);
        };
        let keys = self.keys.as_ref().ok_or(Error::MissingSeed)?;

        let encrypted_access_key =
            access::wrap_db_key_for_peer(&keys.dh, &grant.grantee_public, db_key)?;

        let params = RequestParams::GrantDatabaseAccess(GrantDatabaseAccessParams {
            db_name_hash: grant.db_name_hash,
            username: grant.username,
            read_only: grant.read_only,
            encrypted_access_key,
        });
        let ticket = grant.ticket;
        Ok(vec![self.send(params, move |_| Purpose::Resolve { ticket }, now)])
    }

    /// The user rejected the grantee; the caller learns via `Canceled`.
    pub fn deny_grant_send(&mut self, token: u64) -> Vec<Action> {
        match self.pending_grant_sends.remove(&token) {
            Some(grant) => vec![Action::ResolveRequest {
                request_id: grant.ticket,
                result: Err(Error::Canceled),
            }],
            None => vec![],
        }
    }

    /// Enumerate grants other users offered to this one. Each decryptable
    /// grant is surfaced for fingerprint confirmation; the ticket resolves
    /// with a summary of the offers.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] before `Ready`.
    pub fn get_database_access_grants(&mut self, now: Instant) -> Result<Submitted, Error> {
        self.require_ready()?;
        Ok(self.submit(
            RequestParams::GetDatabaseAccessGrants,
            |ticket| Purpose::AccessGrants { ticket },
            now,
        ))
    }

    fn on_grants_listed(
        &mut self,
        ticket: String,
        outcome: Result<Option<Value>, Error>,
    ) -> Vec<Action> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Listed {
            #[serde(default)]
            database_access_grants: Vec<DatabaseAccessGrant>,
        }

        let data = match outcome {
            Ok(data) => data,
            Err(err) => {
                return vec![Action::ResolveRequest { request_id: ticket, result: Err(err) }];
            },
        };

        let listed: Listed =
            match serde_json::from_value(data.unwrap_or_else(|| json!({}))) {
                Ok(listed) => listed,
                Err(err) => {
                    return vec![Action::ResolveRequest {
                        request_id: ticket,
                        result: Err(Error::Proto(coffer_proto::ProtoError::from(err))),
                    }];
                },
            };

        // Decrypt first (borrowing the key set), then register the offers.
        let offers: Vec<GrantOffer> = {
            let Some(keys) = self.keys.as_ref() else {
                return vec![Action::ResolveRequest {
                    request_id: ticket,
                    result: Err(Error::MissingSeed),
                }];
            };
            listed
                .database_access_grants
                .iter()
                .filter_map(|grant| match access::decrypt_grant(&keys.dh, grant) {
                    Ok(offer) => Some(offer),
                    Err(err) => {
                        // One bad grant must not block the rest.
                        warn!(%err, db_id = %grant.db_id, "skipping undecryptable grant");
                        None
                    },
                })
                .collect()
        };

        let mut actions = Vec::new();
        let mut summaries = Vec::new();
        for offer in offers {
            let token = self.allocate_token();
            summaries.push(json!({
                "dbName": offer.db_name,
                "ownerFingerprint": offer.owner_fingerprint,
                "readOnly": offer.read_only,
            }));
            actions.push(Action::ConfirmGrantAccept {
                token,
                db_name: offer.db_name.clone(),
                owner_fingerprint: offer.owner_fingerprint.clone(),
                read_only: offer.read_only,
            });
            self.pending_grant_offers.insert(token, offer);
        }

        actions.push(Action::ResolveRequest {
            request_id: ticket,
            result: Ok(Some(json!({ "grants": summaries }))),
        });
        actions
    }

    /// The user verified the owner's fingerprint; accept the grant by
    /// rewrapping the database key under this user's own keys.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] for an unknown token.
    pub fn approve_grant_accept(&mut self, token: u64, now: Instant) -> Result<Submitted, Error> {
        let offer = self
            .pending_grant_offers
            .remove(&token)
            .ok_or(Error::InvalidState("approve_grant_accept"))?;
        let keys = self.require_keys()?;

        let params = RequestParams::AcceptDatabaseAccess(access::accept_params(
            &keys.encryption,
            &keys.hmac,
            &offer,
        ));
        Ok(self.submit_resolving(params, now))
    }

    /// The user rejected the grant; it stays pending server-side.
    pub fn deny_grant_accept(&mut self, token: u64) {
        self.pending_grant_offers.remove(&token);
    }

    // ── Sign-out ────────────────────────────────────────────────────────

    /// Sign out: clears the local session unconditionally first, so a
    /// network failure cannot leave the device signed in locally, then
    /// notifies the server. The connection closes when the response (or its
    /// deadline) arrives.
    ///
    /// # Errors
    ///
    /// [`Error::Store`] if the local session cannot be cleared.
    pub fn sign_out(&mut self, now: Instant) -> Result<Submitted, Error> {
        self.store
            .sign_out_session(&self.username)
            .map_err(|e| Error::Store(e.to_string()))?;

        let params =
            RequestParams::SignOut(SignOutParams { session_id: self.session_id.clone() });
        Ok(self.submit(params, |ticket| Purpose::SignOut { ticket }, now))
    }

    // ── Response correlation ────────────────────────────────────────────

    fn handle_response(&mut self, response: Response, now: Instant) -> Vec<Action> {
        let Some(pending) = self.pending.resolve(&response.request_id) else {
            debug!(
                request_id = %response.request_id,
                "response for unknown or already-resolved request discarded"
            );
            return vec![];
        };

        let outcome: Result<Option<Value>, Error> = if response.response.is_success() {
            Ok(response.response.data)
        } else {
            Err(Error::RequestFailed {
                action: pending.action,
                status: response.response.status,
                message: response.response.message.unwrap_or_default(),
            })
        };

        match pending.purpose {
            Purpose::Resolve { ticket } => {
                vec![Action::ResolveRequest { request_id: ticket, result: outcome }]
            },
            Purpose::OpenDatabase { db_name_hash, ticket, retried } => {
                self.on_open_database_resolved(db_name_hash, ticket, retried, outcome, now)
            },
            Purpose::CreateDatabase { db_name_hash, ticket } => {
                self.on_create_database_resolved(db_name_hash, ticket, outcome, now)
            },
            Purpose::FindDatabases { ticket } => self.on_find_databases_resolved(ticket, outcome),
            Purpose::ValidateKey => self.on_validate_key_resolved(outcome, now),
            Purpose::RequestSeed => self.on_request_seed_resolved(outcome, now),
            Purpose::GetRequestsForSeed => self.on_seed_requests_listed(outcome),
            Purpose::SendSeed { peer_hash } => {
                if let Err(err) = outcome {
                    // Free the slot so the peer can retry the handshake.
                    warn!(%err, "seed send failed");
                    self.seed_sends.remove(&peer_hash);
                }
                vec![]
            },
            Purpose::SignOut { ticket } => {
                let result = outcome.map(|_| None);
                let mut actions =
                    vec![Action::ResolveRequest { request_id: ticket, result }];
                actions.extend(self.close(None));
                actions
            },
            Purpose::Bundle { db_id } => {
                if let Err(err) = outcome {
                    warn!(%err, %db_id, "bundle upload rejected");
                }
                vec![]
            },
            Purpose::GetPublicKeyForGrant { ticket, db_name_hash, username, read_only } => {
                self.on_grantee_public_key(ticket, db_name_hash, username, read_only, outcome)
            },
            Purpose::AccessGrants { ticket } => self.on_grants_listed(ticket, outcome),
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn require_ready(&self) -> Result<(), Error> {
        if self.phase == Phase::Ready {
            Ok(())
        } else {
            Err(Error::InvalidState("connection is not ready"))
        }
    }

    fn require_keys(&self) -> Result<&KeySet, Error> {
        self.keys.as_ref().ok_or(Error::MissingSeed)
    }

    fn allocate_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Register and build a request whose purpose is derived from its own
    /// fresh id.
    fn send(
        &mut self,
        params: RequestParams,
        purpose: impl FnOnce(String) -> Purpose,
        now: Instant,
    ) -> Action {
        let request_id = self.pending.next_request_id();
        self.pending.register(
            request_id.clone(),
            params.action(),
            purpose(request_id.clone()),
            now,
        );
        Action::SendRequest(Request { request_id, params })
    }

    /// Submit an operation whose ticket is its own request id.
    fn submit(
        &mut self,
        params: RequestParams,
        purpose: impl FnOnce(String) -> Purpose,
        now: Instant,
    ) -> Submitted {
        let request_id = self.pending.next_request_id();
        self.pending.register(
            request_id.clone(),
            params.action(),
            purpose(request_id.clone()),
            now,
        );
        Submitted {
            ticket: request_id.clone(),
            actions: vec![Action::SendRequest(Request { request_id, params })],
        }
    }

    fn submit_resolving(&mut self, params: RequestParams, now: Instant) -> Submitted {
        self.submit(params, |ticket| Purpose::Resolve { ticket }, now)
    }
}

/// Ticket carried by a purpose, if it resolves a caller.
fn ticket_of(purpose: &Purpose) -> Option<&str> {
    match purpose {
        Purpose::Resolve { ticket }
        | Purpose::OpenDatabase { ticket, .. }
        | Purpose::CreateDatabase { ticket, .. }
        | Purpose::FindDatabases { ticket }
        | Purpose::SignOut { ticket }
        | Purpose::GetPublicKeyForGrant { ticket, .. }
        | Purpose::AccessGrants { ticket } => Some(ticket),
        Purpose::ValidateKey
        | Purpose::RequestSeed
        | Purpose::GetRequestsForSeed
        | Purpose::SendSeed { .. }
        | Purpose::Bundle { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use coffer_crypto::DhSecret;
    use coffer_proto::ResponseBody;

    use super::*;
    use crate::store::MemoryStore;

    const SEED: &[u8] = b"0123456789abcdef0123456789abcdef";

    struct TestServer {
        secret: DhSecret,
        salts: SaltsWire,
        nonce: Vec<u8>,
    }

    impl TestServer {
        fn new() -> Self {
            Self {
                secret: DhSecret::generate(),
                salts: SaltsWire {
                    encryption_key_salt: bundle::to_base64(b"salt-enc"),
                    dh_key_salt: bundle::to_base64(b"salt-dh"),
                    hmac_key_salt: bundle::to_base64(b"salt-hmac"),
                },
                nonce: b"validation-nonce".to_vec(),
            }
        }

        fn config(&self) -> ConnectionConfig {
            ConnectionConfig { server_public_key: self.secret.public_key() }
        }

        /// The `Connection` event this server would push for a user holding
        /// `seed`.
        fn connection_event(&self, seed: &[u8]) -> ServerMessage {
            let salts = Salts::from_wire(&self.salts).unwrap();
            let keys = KeySet::derive(seed, &salts).unwrap();
            let shared = dh::shared_key(&self.secret, &keys.dh.public_key()).unwrap();
            ServerMessage::Event(ServerEvent::Connection {
                salts: self.salts.clone(),
                encrypted_validation_message: bundle::to_base64(&aead::encrypt(
                    &shared,
                    &self.nonce,
                )),
            })
        }
    }

    fn success(request_id: &str, data: Option<Value>) -> ServerMessage {
        ServerMessage::Response(Response {
            request_id: request_id.to_string(),
            response: ResponseBody { status: 200, data, message: None },
        })
    }

    fn failure(request_id: &str, status: u16) -> ServerMessage {
        ServerMessage::Response(Response {
            request_id: request_id.to_string(),
            response: ResponseBody { status, data: None, message: Some("nope".to_string()) },
        })
    }

    fn seeded_store(username: &str) -> MemoryStore {
        let store = MemoryStore::new();
        store.save_seed(username, &bundle::to_base64(SEED)).unwrap();
        store
    }

    fn request_of(action: &Action) -> &Request {
        match action {
            Action::SendRequest(request) => request,
            other => panic!("expected SendRequest, got {other:?}"),
        }
    }

    /// Drive a fresh connection to `Ready`, returning it and the validate
    /// request id consumed along the way.
    fn ready_connection(server: &TestServer) -> Connection<MemoryStore> {
        let mut conn = Connection::new(
            server.config(),
            "alice".to_string(),
            "session-1".to_string(),
            seeded_store("alice"),
        );
        let now = Instant::now();
        conn.connect(now).unwrap();

        let actions = conn.handle_message(server.connection_event(SEED), now);
        let validate = request_of(&actions[0]);
        assert!(matches!(validate.params, RequestParams::ValidateKey(_)));
        let validate_id = validate.request_id.clone();

        let actions = conn.handle_message(success(&validate_id, None), now);
        assert!(matches!(actions[0], Action::ConnectionReady));
        assert_eq!(conn.phase(), Phase::Ready);
        conn
    }

    #[test]
    fn second_connect_is_rejected() {
        let server = TestServer::new();
        let mut conn = Connection::new(
            server.config(),
            "alice".to_string(),
            "s".to_string(),
            seeded_store("alice"),
        );
        let now = Instant::now();
        conn.connect(now).unwrap();
        assert_eq!(conn.connect(now).unwrap_err(), Error::AlreadyConnected);
    }

    #[test]
    fn stored_seed_leads_to_key_validation() {
        let server = TestServer::new();
        let mut conn = Connection::new(
            server.config(),
            "alice".to_string(),
            "s".to_string(),
            seeded_store("alice"),
        );
        let now = Instant::now();
        conn.connect(now).unwrap();

        let actions = conn.handle_message(server.connection_event(SEED), now);
        assert_eq!(conn.phase(), Phase::KeyInit);

        // The echoed nonce must be the decrypted validation message.
        match &request_of(&actions[0]).params {
            RequestParams::ValidateKey(params) => {
                assert_eq!(bundle::from_base64(&params.validation_message).unwrap(), server.nonce);
            },
            other => panic!("expected ValidateKey, got {other:?}"),
        }
    }

    #[test]
    fn validation_success_reaches_ready_and_fetches_seed_requests() {
        let server = TestServer::new();
        let mut conn = Connection::new(
            server.config(),
            "alice".to_string(),
            "s".to_string(),
            seeded_store("alice"),
        );
        let now = Instant::now();
        conn.connect(now).unwrap();

        let actions = conn.handle_message(server.connection_event(SEED), now);
        let validate_id = request_of(&actions[0]).request_id.clone();

        let actions = conn.handle_message(success(&validate_id, None), now);
        assert!(matches!(actions[0], Action::ConnectionReady));
        assert!(matches!(
            request_of(&actions[1]).params,
            RequestParams::GetRequestsForSeed
        ));
        assert_eq!(conn.phase(), Phase::Ready);
    }

    #[test]
    fn validation_failure_is_fatal() {
        let server = TestServer::new();
        let mut conn = Connection::new(
            server.config(),
            "alice".to_string(),
            "s".to_string(),
            seeded_store("alice"),
        );
        let now = Instant::now();
        conn.connect(now).unwrap();

        let actions = conn.handle_message(server.connection_event(SEED), now);
        let validate_id = request_of(&actions[0]).request_id.clone();

        let actions = conn.handle_message(failure(&validate_id, 401), now);
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Close { error: Some(Error::KeyValidationFailed) }
        )));
        assert_eq!(conn.phase(), Phase::Disconnected);
    }

    #[test]
    fn wrong_seed_fails_before_validation_is_sent() {
        let server = TestServer::new();
        let store = MemoryStore::new();
        store
            .save_seed("alice", &bundle::to_base64(b"ffffffffffffffffffffffffffffffff"))
            .unwrap();
        let mut conn =
            Connection::new(server.config(), "alice".to_string(), "s".to_string(), store);
        let now = Instant::now();
        conn.connect(now).unwrap();

        // The validation message was encrypted for the canonical derivation
        // of SEED; a different seed cannot open it.
        let actions = conn.handle_message(server.connection_event(SEED), now);
        assert!(actions.iter().any(|action| matches!(
            action,
            Action::Close { error: Some(Error::Crypto(coffer_crypto::CryptoError::Authentication)) }
        )));
    }

    #[test]
    fn missing_seed_starts_the_pairing_handshake() {
        let server = TestServer::new();
        let store = MemoryStore::new();
        let mut conn = Connection::new(
            server.config(),
            "alice".to_string(),
            "s".to_string(),
            store.clone(),
        );
        let now = Instant::now();
        conn.connect(now).unwrap();

        let actions = conn.handle_message(server.connection_event(SEED), now);
        assert_eq!(conn.phase(), Phase::NeedSeed);
        assert!(matches!(
            request_of(&actions[0]).params,
            RequestParams::RequestSeed(_)
        ));
        // The ephemeral pair is persisted so a restart resumes the same
        // handshake.
        assert!(store.get_seed_request("alice").unwrap().is_some());
    }

    #[test]
    fn empty_seed_response_surfaces_the_prompt() {
        let server = TestServer::new();
        let mut conn = Connection::new(
            server.config(),
            "alice".to_string(),
            "s".to_string(),
            MemoryStore::new(),
        );
        let now = Instant::now();
        conn.connect(now).unwrap();

        let actions = conn.handle_message(server.connection_event(SEED), now);
        let request_id = request_of(&actions[0]).request_id.clone();

        let actions = conn.handle_message(success(&request_id, None), now);
        assert!(matches!(actions[0], Action::PromptForSeed { .. }));
    }

    #[test]
    fn provided_seed_is_persisted_and_validated() {
        let server = TestServer::new();
        let store = MemoryStore::new();
        let mut conn = Connection::new(
            server.config(),
            "alice".to_string(),
            "s".to_string(),
            store.clone(),
        );
        let now = Instant::now();
        conn.connect(now).unwrap();
        conn.handle_message(server.connection_event(SEED), now);

        let actions = conn.provide_seed(&bundle::to_base64(SEED), now).unwrap();
        assert_eq!(conn.phase(), Phase::KeyInit);
        assert!(matches!(request_of(&actions[0]).params, RequestParams::ValidateKey(_)));
        assert_eq!(store.get_seed("alice").unwrap(), Some(bundle::to_base64(SEED)));
        assert!(store.get_seed_request("alice").unwrap().is_none());
    }

    #[test]
    fn short_or_malformed_seed_entry_is_rejected_without_state_change() {
        let server = TestServer::new();
        let mut conn = Connection::new(
            server.config(),
            "alice".to_string(),
            "s".to_string(),
            MemoryStore::new(),
        );
        let now = Instant::now();
        conn.connect(now).unwrap();
        conn.handle_message(server.connection_event(SEED), now);

        assert!(conn.provide_seed("!!not-base64!!", now).is_err());
        assert!(conn.provide_seed(&bundle::to_base64(b"short"), now).is_err());
        assert_eq!(conn.phase(), Phase::NeedSeed);
    }

    #[test]
    fn cancel_seed_entry_signs_out_with_canceled() {
        let server = TestServer::new();
        let store = MemoryStore::new();
        store.save_session("alice", "s").unwrap();
        let mut conn = Connection::new(
            server.config(),
            "alice".to_string(),
            "s".to_string(),
            store.clone(),
        );
        let now = Instant::now();
        conn.connect(now).unwrap();
        conn.handle_message(server.connection_event(SEED), now);

        let actions = conn.cancel_seed_entry();
        assert!(matches!(
            request_of(&actions[0]).params,
            RequestParams::SignOut(_)
        ));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Close { error: Some(Error::Canceled) })));
        // Local session artifacts cleared regardless of the network.
        assert!(store.get_session("alice").unwrap().is_none());
    }

    #[test]
    fn response_for_unknown_id_is_discarded() {
        let server = TestServer::new();
        let mut conn = ready_connection(&server);
        let actions = conn.handle_message(success("999", None), Instant::now());
        assert!(actions.is_empty());
    }

    #[test]
    fn response_after_resolution_is_a_noop() {
        let server = TestServer::new();
        let mut conn = ready_connection(&server);
        let now = Instant::now();

        let submitted = conn.find_databases(now).unwrap();
        let id = submitted.ticket.clone();

        let first = conn.handle_message(success(&id, Some(json!({"databases": []}))), now);
        assert_eq!(first.len(), 1);

        let second = conn.handle_message(success(&id, None), now);
        assert!(second.is_empty(), "a second response for the same id resolves nothing");
    }

    #[test]
    fn request_failure_is_surfaced_to_the_caller() {
        let server = TestServer::new();
        let mut conn = ready_connection(&server);
        let now = Instant::now();

        let submitted = conn.get_database("notes", now).unwrap();
        let actions = conn.handle_message(failure(&submitted.ticket, 403), now);

        match &actions[0] {
            Action::ResolveRequest { request_id, result } => {
                assert_eq!(request_id, &submitted.ticket);
                assert!(matches!(
                    result,
                    Err(Error::RequestFailed { status: 403, action: coffer_proto::Action::GetDatabase, .. })
                ));
            },
            other => panic!("expected ResolveRequest, got {other:?}"),
        }
    }

    #[test]
    fn mutations_require_an_open_database() {
        let server = TestServer::new();
        let mut conn = ready_connection(&server);
        let now = Instant::now();

        let err = conn.insert("notes", "1", &json!({"x": 1}), now).unwrap_err();
        assert_eq!(err, Error::DatabaseNotOpen("notes".to_string()));
    }

    #[test]
    fn open_database_retries_through_create_on_404() {
        let server = TestServer::new();
        let mut conn = ready_connection(&server);
        let now = Instant::now();

        let submitted = conn.open_database("notes", now).unwrap();
        let open_id = match &submitted.actions[0] {
            Action::SendRequest(request) => {
                assert!(matches!(request.params, RequestParams::OpenDatabase(_)));
                request.request_id.clone()
            },
            other => panic!("expected SendRequest, got {other:?}"),
        };

        // 404 → CreateDatabase with wrapped key and encrypted name.
        let actions = conn.handle_message(failure(&open_id, 404), now);
        let create = request_of(&actions[0]);
        let create_id = create.request_id.clone();
        assert!(matches!(create.params, RequestParams::CreateDatabase(_)));

        // Create ok → OpenDatabase retry.
        let actions = conn.handle_message(success(&create_id, None), now);
        let reopen = request_of(&actions[0]);
        let reopen_id = reopen.request_id.clone();
        assert!(matches!(reopen.params, RequestParams::OpenDatabase(_)));

        // Retry ok → original ticket resolves.
        let actions = conn.handle_message(success(&reopen_id, None), now);
        match &actions[0] {
            Action::ResolveRequest { request_id, result } => {
                assert_eq!(request_id, &submitted.ticket);
                assert!(result.is_ok());
            },
            other => panic!("expected ResolveRequest, got {other:?}"),
        }
    }

    #[test]
    fn unknown_db_push_without_hash_is_silently_ignored() {
        let server = TestServer::new();
        let mut conn = ready_connection(&server);

        let push = ServerMessage::Event(ServerEvent::ApplyTransactions {
            db_id: "never-opened".to_string(),
            db_name_hash: None,
            db_key: None,
            bundle: None,
            bundle_seq_no: None,
            transaction_log: vec![],
        });
        let actions = conn.handle_message(push, Instant::now());
        assert!(actions.is_empty());
    }

    #[test]
    fn connect_deadline_closes_with_timeout() {
        let server = TestServer::new();
        let mut conn = Connection::new(
            server.config(),
            "alice".to_string(),
            "s".to_string(),
            seeded_store("alice"),
        );
        let start = Instant::now();
        conn.connect(start).unwrap();

        assert!(conn.tick(start + Duration::from_secs(9)).is_empty());

        let actions = conn.tick(start + Duration::from_secs(11));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Close { error: Some(Error::Timeout) })));
        assert_eq!(conn.phase(), Phase::Disconnected);
    }

    #[test]
    fn close_fails_all_pending_with_disconnected() {
        let server = TestServer::new();
        let mut conn = ready_connection(&server);
        let now = Instant::now();

        let a = conn.find_databases(now).unwrap();
        let b = conn.get_database("x", now).unwrap();
        assert_eq!(conn.pending_requests(), 3); // includes GetRequestsForSeed

        let actions = conn.close(None);
        let resolved: Vec<&String> = actions
            .iter()
            .filter_map(|action| match action {
                Action::ResolveRequest { request_id, result: Err(Error::Disconnected) } => {
                    Some(request_id)
                },
                _ => None,
            })
            .collect();
        assert!(resolved.contains(&&a.ticket));
        assert!(resolved.contains(&&b.ticket));
        assert_eq!(conn.pending_requests(), 0);
        assert_eq!(conn.phase(), Phase::Disconnected);
    }

    #[test]
    fn sign_out_clears_session_before_the_request() {
        let server = TestServer::new();
        let store = seeded_store("alice");
        store.save_session("alice", "session-1").unwrap();

        let mut conn = Connection::new(
            server.config(),
            "alice".to_string(),
            "session-1".to_string(),
            store.clone(),
        );
        let now = Instant::now();
        conn.connect(now).unwrap();
        let actions = conn.handle_message(server.connection_event(SEED), now);
        let validate_id = request_of(&actions[0]).request_id.clone();
        conn.handle_message(success(&validate_id, None), now);

        let submitted = conn.sign_out(now).unwrap();
        // Local artifacts are already gone even though no response arrived.
        assert!(store.get_session("alice").unwrap().is_none());

        let actions = conn.handle_message(success(&submitted.ticket, None), now);
        assert!(actions.iter().any(|a| matches!(a, Action::Close { error: None })));
        assert_eq!(conn.phase(), Phase::Disconnected);
    }

    #[test]
    fn seed_request_event_dedupes_per_peer() {
        let server = TestServer::new();
        let mut conn = ready_connection(&server);
        let requester = DhSecret::generate();
        let requester_b64 = bundle::to_base64(&requester.public_key());

        let event = ServerMessage::Event(ServerEvent::ReceiveRequestForSeed {
            requester_public_key: requester_b64.clone(),
        });

        let first = conn.handle_message(event.clone(), Instant::now());
        assert!(matches!(first[0], Action::ConfirmSeedSend { .. }));

        let second = conn.handle_message(event, Instant::now());
        assert!(second.is_empty(), "at most one in-flight handshake per peer key");
    }

    #[test]
    fn approved_seed_send_encrypts_for_the_requester() {
        let server = TestServer::new();
        let mut conn = ready_connection(&server);
        let now = Instant::now();
        let requester = DhSecret::generate();

        let event = ServerMessage::Event(ServerEvent::ReceiveRequestForSeed {
            requester_public_key: bundle::to_base64(&requester.public_key()),
        });
        let actions = conn.handle_message(event, now);
        let token = match actions[0] {
            Action::ConfirmSeedSend { token, .. } => token,
            ref other => panic!("expected ConfirmSeedSend, got {other:?}"),
        };

        let actions = conn.approve_seed_send(token, now).unwrap();
        let request = request_of(&actions[0]);
        let RequestParams::SendSeed(params) = &request.params else {
            panic!("expected SendSeed params");
        };

        // The requester can decrypt the seed with its ephemeral secret and
        // the sender's derived public key.
        let salts = Salts::from_wire(&server.salts).unwrap();
        let sender_keys = KeySet::derive(SEED, &salts).unwrap();
        let seed = access::decrypt_seed(
            &requester,
            &sender_keys.dh.public_key(),
            &params.encrypted_seed,
        )
        .unwrap();
        assert_eq!(seed.as_slice(), SEED);
    }

    #[test]
    fn denied_seed_send_frees_the_handshake_slot() {
        let server = TestServer::new();
        let mut conn = ready_connection(&server);
        let requester = DhSecret::generate();
        let event = ServerMessage::Event(ServerEvent::ReceiveRequestForSeed {
            requester_public_key: bundle::to_base64(&requester.public_key()),
        });

        let actions = conn.handle_message(event.clone(), Instant::now());
        let token = match actions[0] {
            Action::ConfirmSeedSend { token, .. } => token,
            ref other => panic!("expected ConfirmSeedSend, got {other:?}"),
        };
        conn.deny_seed_send(token);

        let retry = conn.handle_message(event, Instant::now());
        assert!(matches!(retry[0], Action::ConfirmSeedSend { .. }), "peer may ask again");
    }
}
