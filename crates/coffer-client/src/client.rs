//! Async client façade and driver.
//!
//! A single driver task owns the connection state machine and the socket;
//! it is the only place core state is touched, so the core's
//! single-event-task assumptions hold without locks. Callers talk to the
//! driver over a command channel and are completed through oneshot
//! channels when their request id resolves.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use coffer_core::{
    Action, Connection, ConnectionConfig, Error, ItemView, LocalStore, Submitted, WriteOp,
};
use coffer_crypto::dh;
use coffer_proto::ServerMessage;
use rand::{rngs::OsRng, RngCore};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};

use crate::transport::{self, Transport};

/// Interval of the driver's maintenance tick.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// At most one live connection per process.
static LIVE_CONNECTION: AtomicBool = AtomicBool::new(false);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `http://` or `https://` base URL of the server.
    pub endpoint: String,
    /// Application id, appended to the endpoint query.
    pub app_id: String,
    /// The signed-in username.
    pub username: String,
    /// Server DH public key; the compiled-in deployment key by default.
    pub server_public_key: [u8; 32],
}

impl ClientConfig {
    /// Configuration against the compiled-in deployment key.
    pub fn new(
        endpoint: impl Into<String>,
        app_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            app_id: app_id.into(),
            username: username.into(),
            server_public_key: dh::SERVER_PUBLIC_KEY,
        }
    }
}

/// Host-supplied UI capabilities.
///
/// The core never talks to a UI directly; these callbacks are invoked off
/// the driver task. `seed_prompt` is a notification — the host answers
/// later through [`Client::provide_seed`] or [`Client::cancel_seed_entry`].
/// The `confirm_*` methods may block on the user and return the decision.
pub trait UiHandler: Send + Sync + 'static {
    /// No paired device answered; ask the user to type the seed. The
    /// fingerprint identifies this device to the user's other devices.
    fn seed_prompt(&self, device_fingerprint: &str);

    /// Another device asks for the seed; `true` releases it.
    fn confirm_seed_send(&self, requester_fingerprint: &str) -> bool;

    /// About to send a database grant; `true` releases it.
    fn confirm_grant_send(&self, db_name: &str, username: &str, grantee_fingerprint: &str)
        -> bool;

    /// Another user offered a database; `true` accepts it.
    fn confirm_grant_accept(&self, db_name: &str, owner_fingerprint: &str, read_only: bool)
        -> bool;
}

/// A [`UiHandler`] for headless hosts: never prompts, denies everything.
pub struct DenyAllUi;

impl UiHandler for DenyAllUi {
    fn seed_prompt(&self, _device_fingerprint: &str) {}

    fn confirm_seed_send(&self, _requester_fingerprint: &str) -> bool {
        false
    }

    fn confirm_grant_send(&self, _db: &str, _user: &str, _fingerprint: &str) -> bool {
        false
    }

    fn confirm_grant_accept(&self, _db: &str, _fingerprint: &str, _read_only: bool) -> bool {
        false
    }
}

/// One database listed by [`Client::find_databases`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseInfo {
    /// Decrypted database name.
    pub db_name: String,
    /// Server-assigned id.
    pub db_id: String,
    /// HMAC name hash.
    pub db_name_hash: String,
}

type ReplySender = oneshot::Sender<Result<Option<Value>, Error>>;
type ChangeCallback = Box<dyn FnMut(Vec<ItemView>) + Send>;

enum Command {
    OpenDatabase { db_name: String, on_change: ChangeCallback, reply: ReplySender },
    Insert { db_name: String, item_id: String, record: Value, reply: ReplySender },
    Update { db_name: String, item_id: String, record: Value, reply: ReplySender },
    Delete { db_name: String, item_id: String, reply: ReplySender },
    Batch { db_name: String, ops: Vec<WriteOp>, reply: ReplySender },
    FindDatabases { reply: ReplySender },
    GetDatabase { db_name: String, reply: ReplySender },
    Grant { db_name: String, username: String, read_only: bool, reply: ReplySender },
    GetGrants { reply: ReplySender },
    ProvideSeed { seed: String, reply: ReplySender },
    CancelSeedEntry,
    SignOut { reply: ReplySender },
    SeedSendDecision { token: u64, approved: bool },
    GrantSendDecision { token: u64, approved: bool },
    GrantAcceptDecision { token: u64, approved: bool },
}

#[derive(Clone)]
enum ReadyState {
    Pending,
    Ready,
    Failed(Error),
}

/// Handle to a live connection.
///
/// Cheap to clone; all clones talk to the same driver task. The connection
/// closes when the server side ends, on `sign_out`, or when the last
/// handle is dropped.
#[derive(Clone)]
pub struct Client {
    commands: mpsc::Sender<Command>,
    ready: watch::Receiver<ReadyState>,
}

impl Client {
    /// Open the transport and start the driver.
    ///
    /// The returned client is usable once [`Client::ready`] resolves; for
    /// a first device that means after the user answered the seed prompt.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyConnected`] while another client is live in this
    /// process, [`Error::Transport`] if the socket cannot be established.
    pub async fn connect<S: LocalStore>(
        config: ClientConfig,
        store: S,
        ui: Arc<dyn UiHandler>,
    ) -> Result<Self, Error> {
        let guard = LiveGuard::acquire()?;

        let session_id = match store
            .get_session(&config.username)
            .map_err(|e| Error::Store(e.to_string()))?
        {
            Some(session_id) => session_id,
            None => {
                let session_id = fresh_session_id();
                store
                    .save_session(&config.username, &session_id)
                    .map_err(|e| Error::Store(e.to_string()))?;
                session_id
            },
        };

        let url = transport::endpoint_url(&config.endpoint, &config.app_id, &session_id)
            .map_err(|e| Error::Transport(e.to_string()))?;
        let transport =
            transport::connect(&url).await.map_err(|e| Error::Transport(e.to_string()))?;

        let mut connection = Connection::new(
            ConnectionConfig { server_public_key: config.server_public_key },
            config.username.clone(),
            session_id,
            store,
        );
        connection.connect(Instant::now())?;

        let (command_tx, command_rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);

        let driver = Driver {
            connection,
            transport,
            commands: command_rx,
            command_tx: command_tx.downgrade(),
            waiters: HashMap::new(),
            callbacks: HashMap::new(),
            ready: ready_tx,
            ui,
            shutdown: false,
            _guard: guard,
        };
        tokio::spawn(driver.run());

        Ok(Self { commands: command_tx, ready: ready_rx })
    }

    /// Wait until key validation succeeded (or the connection failed).
    ///
    /// # Errors
    ///
    /// The terminating error if the connection closed first.
    pub async fn ready(&self) -> Result<(), Error> {
        let mut ready = self.ready.clone();
        loop {
            match &*ready.borrow() {
                ReadyState::Pending => {},
                ReadyState::Ready => return Ok(()),
                ReadyState::Failed(err) => return Err(err.clone()),
            }
            ready.changed().await.map_err(|_| Error::Disconnected)?;
        }
    }

    /// Open (creating if missing) a database and subscribe to its changes.
    ///
    /// `on_change` fires with the full item list, in insertion order, after
    /// every server push — including the initial state.
    ///
    /// # Errors
    ///
    /// Any connection-level failure surfaced by the core.
    pub async fn open_database(
        &self,
        db_name: &str,
        on_change: impl FnMut(Vec<ItemView>) + Send + 'static,
    ) -> Result<(), Error> {
        let db_name = db_name.to_string();
        self.request(|reply| Command::OpenDatabase {
            db_name,
            on_change: Box::new(on_change),
            reply,
        })
        .await
        .map(|_| ())
    }

    /// Insert one item. Resolves once the server durably ordered the
    /// transaction; the local replica updates on the subsequent push.
    ///
    /// # Errors
    ///
    /// [`Error::DatabaseNotOpen`], [`Error::Timeout`], or a
    /// [`Error::RequestFailed`] from the server.
    pub async fn insert(&self, db_name: &str, item_id: &str, record: Value) -> Result<(), Error> {
        let (db_name, item_id) = (db_name.to_string(), item_id.to_string());
        self.request(|reply| Command::Insert { db_name, item_id, record, reply })
            .await
            .map(|_| ())
    }

    /// Update one item.
    ///
    /// # Errors
    ///
    /// See [`Client::insert`].
    pub async fn update(&self, db_name: &str, item_id: &str, record: Value) -> Result<(), Error> {
        let (db_name, item_id) = (db_name.to_string(), item_id.to_string());
        self.request(|reply| Command::Update { db_name, item_id, record, reply })
            .await
            .map(|_| ())
    }

    /// Delete one item.
    ///
    /// # Errors
    ///
    /// See [`Client::insert`].
    pub async fn delete(&self, db_name: &str, item_id: &str) -> Result<(), Error> {
        let (db_name, item_id) = (db_name.to_string(), item_id.to_string());
        self.request(|reply| Command::Delete { db_name, item_id, reply }).await.map(|_| ())
    }

    /// Apply an ordered group of writes atomically.
    ///
    /// # Errors
    ///
    /// See [`Client::insert`].
    pub async fn batch_transaction(&self, db_name: &str, ops: Vec<WriteOp>) -> Result<(), Error> {
        let db_name = db_name.to_string();
        self.request(|reply| Command::Batch { db_name, ops, reply }).await.map(|_| ())
    }

    /// Enumerate this user's databases.
    ///
    /// # Errors
    ///
    /// Connection-level failures, or a malformed server listing.
    pub async fn find_databases(&self) -> Result<Vec<DatabaseInfo>, Error> {
        #[derive(Deserialize)]
        struct Listing {
            databases: Vec<DatabaseInfo>,
        }

        let data = self.request(|reply| Command::FindDatabases { reply }).await?;
        let listing: Listing =
            serde_json::from_value(data.unwrap_or_else(|| serde_json::json!({"databases": []})))
                .map_err(coffer_proto::ProtoError::from)?;
        Ok(listing.databases)
    }

    /// Fetch one database's metadata, as the server returns it.
    ///
    /// # Errors
    ///
    /// Connection-level failures.
    pub async fn get_database(&self, db_name: &str) -> Result<Option<Value>, Error> {
        let db_name = db_name.to_string();
        self.request(|reply| Command::GetDatabase { db_name, reply }).await
    }

    /// Offer a database to another user. The UI handler confirms the
    /// grantee's fingerprint before anything is transmitted.
    ///
    /// # Errors
    ///
    /// [`Error::Canceled`] if the user denied the confirmation.
    pub async fn grant_database_access(
        &self,
        db_name: &str,
        username: &str,
        read_only: bool,
    ) -> Result<(), Error> {
        let (db_name, username) = (db_name.to_string(), username.to_string());
        self.request(|reply| Command::Grant { db_name, username, read_only, reply })
            .await
            .map(|_| ())
    }

    /// Enumerate grants offered to this user. Each decryptable grant is
    /// confirmed through the UI handler and accepted on approval; the
    /// returned value summarizes the offers.
    ///
    /// # Errors
    ///
    /// Connection-level failures.
    pub async fn get_database_access_grants(&self) -> Result<Option<Value>, Error> {
        self.request(|reply| Command::GetGrants { reply }).await
    }

    /// Answer the seed prompt with a manually-entered seed (base64).
    ///
    /// # Errors
    ///
    /// Rejected input (malformed base64, short seed) or state errors.
    pub async fn provide_seed(&self, seed: &str) -> Result<(), Error> {
        let seed = seed.to_string();
        self.request(|reply| Command::ProvideSeed { seed, reply }).await.map(|_| ())
    }

    /// Dismiss the seed prompt: signs out and closes the connection.
    pub async fn cancel_seed_entry(&self) {
        let _ = self.commands.send(Command::CancelSeedEntry).await;
    }

    /// Sign out: clears local session state first, notifies the server,
    /// and closes the connection.
    ///
    /// # Errors
    ///
    /// [`Error::Store`] if local state cannot be cleared; network failures
    /// after that point still leave the device signed out locally.
    pub async fn sign_out(&self) -> Result<(), Error> {
        self.request(|reply| Command::SignOut { reply }).await.map(|_| ())
    }

    async fn request(
        &self,
        make: impl FnOnce(ReplySender) -> Command,
    ) -> Result<Option<Value>, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands.send(make(reply_tx)).await.map_err(|_| Error::Disconnected)?;
        reply_rx.await.map_err(|_| Error::Disconnected)?
    }
}

fn fresh_session_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Process-wide live-connection slot.
struct LiveGuard;

impl LiveGuard {
    fn acquire() -> Result<Self, Error> {
        if LIVE_CONNECTION.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyConnected);
        }
        Ok(Self)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        LIVE_CONNECTION.store(false, Ordering::SeqCst);
    }
}

/// The single task that owns the core and the socket.
struct Driver<S: LocalStore> {
    connection: Connection<S>,
    transport: Transport,
    commands: mpsc::Receiver<Command>,
    /// Weak so that dropping the last `Client` handle closes the command
    /// channel and tears the connection down.
    command_tx: mpsc::WeakSender<Command>,
    waiters: HashMap<String, ReplySender>,
    callbacks: HashMap<String, ChangeCallback>,
    ready: watch::Sender<ReadyState>,
    ui: Arc<dyn UiHandler>,
    shutdown: bool,
    _guard: LiveGuard,
}

impl<S: LocalStore> Driver<S> {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while !self.shutdown {
            tokio::select! {
                inbound = self.transport.inbound.recv() => match inbound {
                    Some(text) => self.handle_inbound(&text).await,
                    None => {
                        let actions = self
                            .connection
                            .transport_failed("inbound channel closed".to_string());
                        self.execute(actions).await;
                    },
                },
                Some(transport_error) = self.transport.errors.recv() => {
                    let actions =
                        self.connection.transport_failed(transport_error.to_string());
                    self.execute(actions).await;
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        // Every client handle is gone; tear down.
                        let actions = self.connection.close(None);
                        self.execute(actions).await;
                    },
                },
                _ = ticker.tick() => {
                    let actions = self.connection.tick(Instant::now());
                    self.execute(actions).await;
                },
            }
        }
    }

    async fn handle_inbound(&mut self, text: &str) {
        match ServerMessage::parse(text) {
            Ok(message) => {
                let actions = self.connection.handle_message(message, Instant::now());
                self.execute(actions).await;
            },
            Err(err) => warn!(%err, "discarding unparseable inbound frame"),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::OpenDatabase { db_name, on_change, reply } => {
                // Register before submitting: the first push can arrive
                // right behind the open acknowledgement.
                self.callbacks.insert(db_name.clone(), on_change);
                match self.connection.open_database(&db_name, now) {
                    Ok(submitted) => self.register(submitted, reply).await,
                    Err(err) => {
                        self.callbacks.remove(&db_name);
                        let _ = reply.send(Err(err));
                    },
                }
            },
            Command::Insert { db_name, item_id, record, reply } => {
                let result = self.connection.insert(&db_name, &item_id, &record, now);
                self.register_or_fail(result, reply).await;
            },
            Command::Update { db_name, item_id, record, reply } => {
                let result = self.connection.update(&db_name, &item_id, &record, now);
                self.register_or_fail(result, reply).await;
            },
            Command::Delete { db_name, item_id, reply } => {
                let result = self.connection.delete(&db_name, &item_id, now);
                self.register_or_fail(result, reply).await;
            },
            Command::Batch { db_name, ops, reply } => {
                let result = self.connection.batch_transaction(&db_name, ops, now);
                self.register_or_fail(result, reply).await;
            },
            Command::FindDatabases { reply } => {
                let result = self.connection.find_databases(now);
                self.register_or_fail(result, reply).await;
            },
            Command::GetDatabase { db_name, reply } => {
                let result = self.connection.get_database(&db_name, now);
                self.register_or_fail(result, reply).await;
            },
            Command::Grant { db_name, username, read_only, reply } => {
                let result =
                    self.connection.grant_database_access(&db_name, &username, read_only, now);
                self.register_or_fail(result, reply).await;
            },
            Command::GetGrants { reply } => {
                let result = self.connection.get_database_access_grants(now);
                self.register_or_fail(result, reply).await;
            },
            Command::ProvideSeed { seed, reply } => match self.connection.provide_seed(&seed, now)
            {
                Ok(actions) => {
                    let _ = reply.send(Ok(None));
                    self.execute(actions).await;
                },
                Err(err) => {
                    let _ = reply.send(Err(err));
                },
            },
            Command::CancelSeedEntry => {
                let actions = self.connection.cancel_seed_entry();
                self.execute(actions).await;
            },
            Command::SignOut { reply } => {
                let result = self.connection.sign_out(now);
                self.register_or_fail(result, reply).await;
            },
            Command::SeedSendDecision { token, approved } => {
                if approved {
                    match self.connection.approve_seed_send(token, now) {
                        Ok(actions) => self.execute(actions).await,
                        Err(err) => warn!(%err, "seed send approval failed"),
                    }
                } else {
                    self.connection.deny_seed_send(token);
                }
            },
            Command::GrantSendDecision { token, approved } => {
                if approved {
                    match self.connection.approve_grant_send(token, now) {
                        Ok(actions) => self.execute(actions).await,
                        Err(err) => warn!(%err, "grant send approval failed"),
                    }
                } else {
                    let actions = self.connection.deny_grant_send(token);
                    self.execute(actions).await;
                }
            },
            Command::GrantAcceptDecision { token, approved } => {
                if approved {
                    match self.connection.approve_grant_accept(token, now) {
                        Ok(submitted) => self.execute(submitted.actions).await,
                        Err(err) => warn!(%err, "grant acceptance failed"),
                    }
                } else {
                    self.connection.deny_grant_accept(token);
                }
            },
        }
    }

    async fn register(&mut self, submitted: Submitted, reply: ReplySender) {
        self.waiters.insert(submitted.ticket.clone(), reply);
        self.execute(submitted.actions).await;
    }

    async fn register_or_fail(&mut self, result: Result<Submitted, Error>, reply: ReplySender) {
        match result {
            Ok(submitted) => self.register(submitted, reply).await,
            Err(err) => {
                let _ = reply.send(Err(err));
            },
        }
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::SendRequest(request) => match request.to_wire() {
                    Ok(text) => {
                        if self.transport.outbound.send(text).await.is_err() {
                            let actions = self
                                .connection
                                .transport_failed("outbound channel closed".to_string());
                            // One level deep only: a failed close-send is
                            // final.
                            for follow_up in actions {
                                self.execute_terminal(follow_up);
                            }
                        }
                    },
                    Err(err) => error!(%err, "dropping unserializable request"),
                },
                Action::ResolveRequest { request_id, result } => {
                    match self.waiters.remove(&request_id) {
                        Some(reply) => {
                            let _ = reply.send(result);
                        },
                        None => debug!(%request_id, "resolution without a waiter"),
                    }
                },
                Action::DatabaseChanged { db_name, items } => {
                    if let Some(callback) = self.callbacks.get_mut(&db_name) {
                        callback(items);
                    }
                },
                Action::PromptForSeed { device_fingerprint } => {
                    let ui = Arc::clone(&self.ui);
                    tokio::task::spawn_blocking(move || ui.seed_prompt(&device_fingerprint));
                },
                Action::ConfirmSeedSend { token, requester_fingerprint } => {
                    let ui = Arc::clone(&self.ui);
                    let commands = self.command_tx.clone();
                    tokio::spawn(async move {
                        let approved = tokio::task::spawn_blocking(move || {
                            ui.confirm_seed_send(&requester_fingerprint)
                        })
                        .await
                        .unwrap_or(false);
                        if let Some(commands) = commands.upgrade() {
                            let _ = commands
                                .send(Command::SeedSendDecision { token, approved })
                                .await;
                        }
                    });
                },
                Action::ConfirmGrantSend { token, grantee_fingerprint, db_name, username } => {
                    let ui = Arc::clone(&self.ui);
                    let commands = self.command_tx.clone();
                    tokio::spawn(async move {
                        let approved = tokio::task::spawn_blocking(move || {
                            ui.confirm_grant_send(&db_name, &username, &grantee_fingerprint)
                        })
                        .await
                        .unwrap_or(false);
                        if let Some(commands) = commands.upgrade() {
                            let _ = commands
                                .send(Command::GrantSendDecision { token, approved })
                                .await;
                        }
                    });
                },
                Action::ConfirmGrantAccept { token, db_name, owner_fingerprint, read_only } => {
                    let ui = Arc::clone(&self.ui);
                    let commands = self.command_tx.clone();
                    tokio::spawn(async move {
                        let approved = tokio::task::spawn_blocking(move || {
                            ui.confirm_grant_accept(&db_name, &owner_fingerprint, read_only)
                        })
                        .await
                        .unwrap_or(false);
                        if let Some(commands) = commands.upgrade() {
                            let _ = commands
                                .send(Command::GrantAcceptDecision { token, approved })
                                .await;
                        }
                    });
                },
                Action::ConnectionReady => {
                    let _ = self.ready.send(ReadyState::Ready);
                },
                Action::Close { error } => {
                    self.finish(error);
                },
            }
        }
    }

    /// Execute an action when the transport is already gone: only local
    /// effects are applied.
    fn execute_terminal(&mut self, action: Action) {
        match action {
            Action::ResolveRequest { request_id, result } => {
                if let Some(reply) = self.waiters.remove(&request_id) {
                    let _ = reply.send(result);
                }
            },
            Action::Close { error } => self.finish(error),
            other => debug!("dropping action during teardown: {other:?}"),
        }
    }

    fn finish(&mut self, error: Option<Error>) {
        let state = match &error {
            Some(err) => ReadyState::Failed(err.clone()),
            None => ReadyState::Failed(Error::Disconnected),
        };
        // Only report a failure if readiness was never reached; after that
        // the watch already says Ready and callers observe the close via
        // their individual requests.
        if matches!(*self.ready.borrow(), ReadyState::Pending) {
            let _ = self.ready.send(state);
        }

        for (_, reply) in self.waiters.drain() {
            let _ = reply.send(Err(Error::Disconnected));
        }
        self.callbacks.clear();
        self.transport.shutdown();
        self.shutdown = true;
    }
}
