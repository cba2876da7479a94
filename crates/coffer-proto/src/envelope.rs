//! Request/response envelope and server-pushed events.
//!
//! # Invariants
//!
//! - Each outbound action maps to exactly one [`RequestParams`] variant;
//!   the `action` field on the wire is the variant name.
//! - Parsing never fails on an unknown route: it classifies the message as
//!   [`ServerMessage::UnknownRoute`] instead, since new server pushes must
//!   not break older clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::ProtoError, transaction::Transaction};

/// Success status code in a response body.
pub const SUCCESS_STATUS: u16 = 200;

/// Status code the server uses for a database that does not exist yet.
pub const NOT_FOUND_STATUS: u16 = 404;

/// The outbound action vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// End the session.
    SignOut,
    /// Create a database record server-side.
    CreateDatabase,
    /// Fetch one database's metadata by name hash.
    GetDatabase,
    /// Open a database and subscribe to its transaction log.
    OpenDatabase,
    /// Enumerate the user's databases.
    FindDatabases,
    /// Insert one item.
    Insert,
    /// Update one item.
    Update,
    /// Delete one item.
    Delete,
    /// Apply an ordered group of writes atomically.
    BatchTransaction,
    /// Upload a compacted snapshot of a database.
    Bundle,
    /// Prove possession of the derived DH key.
    ValidateKey,
    /// Ask paired devices for the seed.
    RequestSeed,
    /// Fetch queued seed requests from other devices.
    GetRequestsForSeed,
    /// Answer another device's seed request.
    SendSeed,
    /// Fetch another user's public key.
    GetPublicKey,
    /// Offer a database key to another user.
    GrantDatabaseAccess,
    /// Enumerate grants offered to this user.
    GetDatabaseAccessGrants,
    /// Accept an offered grant.
    AcceptDatabaseAccess,
}

impl Action {
    /// Wire name of the action.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SignOut => "SignOut",
            Self::CreateDatabase => "CreateDatabase",
            Self::GetDatabase => "GetDatabase",
            Self::OpenDatabase => "OpenDatabase",
            Self::FindDatabases => "FindDatabases",
            Self::Insert => "Insert",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::BatchTransaction => "BatchTransaction",
            Self::Bundle => "Bundle",
            Self::ValidateKey => "ValidateKey",
            Self::RequestSeed => "RequestSeed",
            Self::GetRequestsForSeed => "GetRequestsForSeed",
            Self::SendSeed => "SendSeed",
            Self::GetPublicKey => "GetPublicKey",
            Self::GrantDatabaseAccess => "GrantDatabaseAccess",
            Self::GetDatabaseAccessGrants => "GetDatabaseAccessGrants",
            Self::AcceptDatabaseAccess => "AcceptDatabaseAccess",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed parameters for every outbound action.
///
/// Serializes as `"action": <variant>, "params": <fields>`; unit variants
/// carry no `params` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params")]
pub enum RequestParams {
    /// End the session.
    SignOut(SignOutParams),
    /// Create a database record server-side.
    CreateDatabase(CreateDatabaseParams),
    /// Fetch one database's metadata.
    GetDatabase(GetDatabaseParams),
    /// Open a database.
    OpenDatabase(OpenDatabaseParams),
    /// Enumerate the user's databases.
    FindDatabases,
    /// Insert one item.
    Insert(WriteParams),
    /// Update one item.
    Update(WriteParams),
    /// Delete one item.
    Delete(DeleteParams),
    /// Atomic write group.
    BatchTransaction(BatchTransactionParams),
    /// Upload a snapshot.
    Bundle(BundleParams),
    /// Prove key possession.
    ValidateKey(ValidateKeyParams),
    /// Ask paired devices for the seed.
    RequestSeed(RequestSeedParams),
    /// Fetch queued seed requests.
    GetRequestsForSeed,
    /// Answer a seed request.
    SendSeed(SendSeedParams),
    /// Fetch another user's public key.
    GetPublicKey(GetPublicKeyParams),
    /// Offer a database key to another user.
    GrantDatabaseAccess(GrantDatabaseAccessParams),
    /// Enumerate grants offered to this user.
    GetDatabaseAccessGrants,
    /// Accept an offered grant.
    AcceptDatabaseAccess(AcceptDatabaseAccessParams),
}

impl RequestParams {
    /// The action this parameter set belongs to.
    pub fn action(&self) -> Action {
        match self {
            Self::SignOut(_) => Action::SignOut,
            Self::CreateDatabase(_) => Action::CreateDatabase,
            Self::GetDatabase(_) => Action::GetDatabase,
            Self::OpenDatabase(_) => Action::OpenDatabase,
            Self::FindDatabases => Action::FindDatabases,
            Self::Insert(_) => Action::Insert,
            Self::Update(_) => Action::Update,
            Self::Delete(_) => Action::Delete,
            Self::BatchTransaction(_) => Action::BatchTransaction,
            Self::Bundle(_) => Action::Bundle,
            Self::ValidateKey(_) => Action::ValidateKey,
            Self::RequestSeed(_) => Action::RequestSeed,
            Self::GetRequestsForSeed => Action::GetRequestsForSeed,
            Self::SendSeed(_) => Action::SendSeed,
            Self::GetPublicKey(_) => Action::GetPublicKey,
            Self::GrantDatabaseAccess(_) => Action::GrantDatabaseAccess,
            Self::GetDatabaseAccessGrants => Action::GetDatabaseAccessGrants,
            Self::AcceptDatabaseAccess(_) => Action::AcceptDatabaseAccess,
        }
    }
}

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Fresh id the response will carry back.
    pub request_id: String,
    /// Action and its parameters, flattened into the envelope.
    #[serde(flatten)]
    pub params: RequestParams,
}

impl Request {
    /// Serialize to the wire text frame.
    ///
    /// # Errors
    ///
    /// `ProtoError::Json` if serialization fails.
    pub fn to_wire(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `SignOut` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignOutParams {
    /// Session being ended.
    pub session_id: String,
}

/// `CreateDatabase` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDatabaseParams {
    /// HMAC of the database name.
    pub db_name_hash: String,
    /// Database name encrypted under the database key.
    pub encrypted_db_name: String,
    /// Database key wrapped under the user's encryption key.
    pub encrypted_db_key: String,
}

/// `GetDatabase` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDatabaseParams {
    /// HMAC of the database name.
    pub db_name_hash: String,
}

/// `OpenDatabase` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDatabaseParams {
    /// HMAC of the database name.
    pub db_name_hash: String,
}

/// `Insert` / `Update` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteParams {
    /// Server-assigned database id.
    pub db_id: String,
    /// HMAC of the item id.
    pub item_key: String,
    /// Record encrypted under the database key.
    pub encrypted_record: String,
}

/// `Delete` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteParams {
    /// Server-assigned database id.
    pub db_id: String,
    /// HMAC of the item id.
    pub item_key: String,
}

/// One operation inside a `BatchTransaction` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWrite {
    /// `Insert`, `Update`, or `Delete`.
    pub command: crate::transaction::Command,
    /// HMAC of the item id.
    pub item_key: String,
    /// Encrypted record; absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_record: Option<String>,
}

/// `BatchTransaction` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTransactionParams {
    /// Server-assigned database id.
    pub db_id: String,
    /// Ordered operations, applied atomically.
    pub operations: Vec<BatchWrite>,
}

/// `Bundle` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleParams {
    /// Server-assigned database id.
    pub db_id: String,
    /// Sequence number the snapshot covers.
    pub seq_no: u64,
    /// base64(AES-GCM(deflate(JSON snapshot))).
    pub bundle: String,
    /// HMAC item keys, one per live item, so the server can garbage-collect
    /// superseded transactions.
    pub keys: Vec<String>,
}

/// `ValidateKey` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateKeyParams {
    /// The decrypted validation nonce, base64-encoded.
    pub validation_message: String,
}

/// `RequestSeed` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSeedParams {
    /// This device's ephemeral public key, base64-encoded.
    pub requester_public_key: String,
}

/// `SendSeed` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSeedParams {
    /// The requesting device's ephemeral public key, base64-encoded.
    pub requester_public_key: String,
    /// The seed encrypted under the pairing shared key, base64-encoded.
    pub encrypted_seed: String,
}

/// `GetPublicKey` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPublicKeyParams {
    /// Whose public key to fetch.
    pub username: String,
}

/// `GrantDatabaseAccess` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantDatabaseAccessParams {
    /// HMAC of the database name (owner's index).
    pub db_name_hash: String,
    /// Grantee's username.
    pub username: String,
    /// Whether the grantee may only read.
    pub read_only: bool,
    /// Database key wrapped under the pairwise DH shared key.
    pub encrypted_access_key: String,
}

/// `AcceptDatabaseAccess` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptDatabaseAccessParams {
    /// Server-assigned database id.
    pub db_id: String,
    /// Database key rewrapped under the acceptor's own encryption key.
    pub encrypted_db_key: String,
    /// HMAC of the database name under the acceptor's own HMAC key.
    pub db_name_hash: String,
    /// Database name encrypted under the database key.
    pub encrypted_db_name: String,
}

/// Inbound response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Id of the request being answered.
    pub request_id: String,
    /// Outcome.
    pub response: ResponseBody,
}

/// Response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    /// HTTP-style status; [`SUCCESS_STATUS`] on success.
    pub status: u16,
    /// Action-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Human-readable failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResponseBody {
    /// Whether the request succeeded.
    pub fn is_success(&self) -> bool {
        self.status == SUCCESS_STATUS
    }
}

/// Salts delivered by the `Connection` event, base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaltsWire {
    /// HKDF salt for the encryption key.
    pub encryption_key_salt: String,
    /// HKDF salt for the DH scalar.
    pub dh_key_salt: String,
    /// HKDF salt for the HMAC key.
    pub hmac_key_salt: String,
}

/// One pending grant, as listed by `GetDatabaseAccessGrants`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseAccessGrant {
    /// Server-assigned database id.
    pub db_id: String,
    /// Owner's DH public key, base64-encoded.
    pub owner_public_key: String,
    /// Database key wrapped under the pairwise DH shared key.
    pub encrypted_access_key: String,
    /// Database name encrypted under the database key.
    pub encrypted_db_name: String,
    /// Whether the grant is read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Server-pushed events, a closed sum over the `route` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "route")]
pub enum ServerEvent {
    /// Transport session established; delivers salts and the validation
    /// challenge.
    #[serde(rename_all = "camelCase")]
    Connection {
        /// Per-user HKDF salts.
        salts: SaltsWire,
        /// Nonce encrypted under the server DH shared key, base64-encoded.
        encrypted_validation_message: String,
    },
    /// Database state push: optional wrapped key, optional bundle, and the
    /// incremental transaction log.
    #[serde(rename_all = "camelCase")]
    ApplyTransactions {
        /// Server-assigned database id.
        db_id: String,
        /// Present on the first push for a database.
        #[serde(default)]
        db_name_hash: Option<String>,
        /// Database key wrapped under the user's encryption key; present on
        /// the first push.
        #[serde(default)]
        db_key: Option<String>,
        /// Encrypted snapshot, if the server holds one.
        #[serde(default)]
        bundle: Option<String>,
        /// Sequence number the snapshot covers.
        #[serde(default)]
        bundle_seq_no: Option<u64>,
        /// Transactions past the snapshot, ascending by sequence number.
        #[serde(default)]
        transaction_log: Vec<Transaction>,
    },
    /// The server wants a fresh snapshot of this database.
    #[serde(rename_all = "camelCase")]
    BuildBundle {
        /// Server-assigned database id.
        db_id: String,
    },
    /// Another device of this user requests the seed.
    #[serde(rename_all = "camelCase")]
    ReceiveRequestForSeed {
        /// Requesting device's ephemeral public key, base64-encoded.
        requester_public_key: String,
    },
    /// A paired device answered this device's seed request.
    #[serde(rename_all = "camelCase")]
    ReceiveSeed {
        /// Seed encrypted under the pairing shared key, base64-encoded.
        encrypted_seed: String,
        /// Sender's ephemeral public key, base64-encoded.
        sender_public_key: String,
    },
}

/// Routes this client understands.
const KNOWN_ROUTES: &[&str] = &[
    "Connection",
    "ApplyTransactions",
    "BuildBundle",
    "ReceiveRequestForSeed",
    "ReceiveSeed",
];

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Response to an outstanding request.
    Response(Response),
    /// Server-pushed event.
    Event(ServerEvent),
    /// Event with a route this client does not know; log and ignore.
    UnknownRoute(String),
}

impl ServerMessage {
    /// Classify a raw inbound text frame.
    ///
    /// # Errors
    ///
    /// `ProtoError::Envelope` if the frame is not JSON, carries a known
    /// route with a malformed body, or is neither a response nor an event.
    pub fn parse(raw: &str) -> Result<Self, ProtoError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| ProtoError::Envelope(format!("not a JSON object: {e}")))?;

        if let Some(route) = value.get("route").and_then(Value::as_str) {
            let route = route.to_string();
            if !KNOWN_ROUTES.contains(&route.as_str()) {
                return Ok(Self::UnknownRoute(route));
            }
            let event = serde_json::from_value::<ServerEvent>(value)
                .map_err(|e| ProtoError::Envelope(format!("malformed {route} event: {e}")))?;
            return Ok(Self::Event(event));
        }

        if value.get("requestId").is_some() {
            let response = serde_json::from_value::<Response>(value)
                .map_err(|e| ProtoError::Envelope(format!("malformed response: {e}")))?;
            return Ok(Self::Response(response));
        }

        Err(ProtoError::Envelope("neither route nor requestId present".to_string()))
    }
}
