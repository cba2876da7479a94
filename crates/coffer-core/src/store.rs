//! Device-local persistent storage.
//!
//! A trait-based abstraction over whatever durable key/value store the host
//! platform provides. Synchronous, so the sans-IO core can call it directly.
//! Only the connection reads and writes it.
//!
//! Persisted keys, all scoped by username:
//! - `seed:<username>` — the base64 seed after first acquisition
//! - `seedRequest:<username>` — ephemeral pairing keys while seedless
//! - `session:<username>` — the session id

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;

use crate::keys::StoredSeedRequest;

/// Local store failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Underlying storage failed.
    #[error("storage backend: {0}")]
    Backend(String),
    /// A stored blob could not be parsed.
    #[error("corrupt entry under `{key}`")]
    Corrupt {
        /// The offending store key.
        key: String,
    },
}

/// Durable device-scoped key/value storage.
///
/// Implementations share state across clones (typically via `Arc`), so one
/// store instance can serve both the connection and the host application.
pub trait LocalStore: Clone + Send + Sync + 'static {
    /// The saved seed (base64), if this device has one.
    fn get_seed(&self, username: &str) -> Result<Option<String>, StoreError>;

    /// Persist the seed (base64) after first acquisition.
    fn save_seed(&self, username: &str, seed: &str) -> Result<(), StoreError>;

    /// The in-progress seed-request keypair, if any.
    fn get_seed_request(&self, username: &str) -> Result<Option<StoredSeedRequest>, StoreError>;

    /// Persist the seed-request keypair so a restart resumes the same
    /// handshake.
    fn set_seed_request(
        &self,
        username: &str,
        request: &StoredSeedRequest,
    ) -> Result<(), StoreError>;

    /// Drop the seed-request keypair (after the seed arrived).
    fn remove_seed_request(&self, username: &str) -> Result<(), StoreError>;

    /// The saved session id, if any.
    fn get_session(&self, username: &str) -> Result<Option<String>, StoreError>;

    /// Persist the session id.
    fn save_session(&self, username: &str, session_id: &str) -> Result<(), StoreError>;

    /// Clear per-session artifacts. Called before the `SignOut` request is
    /// sent so a network failure cannot leave the device signed in locally.
    fn sign_out_session(&self, username: &str) -> Result<(), StoreError>;
}

/// In-memory [`LocalStore`], for tests and ephemeral hosts.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().expect("store mutex poisoned").get(key).cloned()
    }

    fn put(&self, key: String, value: String) {
        self.entries.lock().expect("store mutex poisoned").insert(key, value);
    }

    fn remove(&self, key: &str) {
        self.entries.lock().expect("store mutex poisoned").remove(key);
    }
}

fn seed_key(username: &str) -> String {
    format!("seed:{username}")
}

fn seed_request_key(username: &str) -> String {
    format!("seedRequest:{username}")
}

fn session_key(username: &str) -> String {
    format!("session:{username}")
}

impl LocalStore for MemoryStore {
    fn get_seed(&self, username: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get(&seed_key(username)))
    }

    fn save_seed(&self, username: &str, seed: &str) -> Result<(), StoreError> {
        self.put(seed_key(username), seed.to_string());
        Ok(())
    }

    fn get_seed_request(&self, username: &str) -> Result<Option<StoredSeedRequest>, StoreError> {
        let key = seed_request_key(username);
        match self.get(&key) {
            None => Ok(None),
            Some(raw) => {
                let (private_key, public_key) =
                    raw.split_once('\n').ok_or(StoreError::Corrupt { key })?;
                Ok(Some(StoredSeedRequest {
                    private_key: private_key.to_string(),
                    public_key: public_key.to_string(),
                }))
            },
        }
    }

    fn set_seed_request(
        &self,
        username: &str,
        request: &StoredSeedRequest,
    ) -> Result<(), StoreError> {
        self.put(
            seed_request_key(username),
            format!("{}\n{}", request.private_key, request.public_key),
        );
        Ok(())
    }

    fn remove_seed_request(&self, username: &str) -> Result<(), StoreError> {
        self.remove(&seed_request_key(username));
        Ok(())
    }

    fn get_session(&self, username: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get(&session_key(username)))
    }

    fn save_session(&self, username: &str, session_id: &str) -> Result<(), StoreError> {
        self.put(session_key(username), session_id.to_string());
        Ok(())
    }

    fn sign_out_session(&self, username: &str) -> Result<(), StoreError> {
        self.remove(&session_key(username));
        Ok(())
    }
}
