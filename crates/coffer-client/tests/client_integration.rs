//! Client-to-socket integration: a real WebSocket server in the test plays
//! the protocol — delivers salts, validates the key proof, acknowledges an
//! open, and pushes encrypted transactions — and the client surfaces the
//! decrypted items through its change callback.

use std::{sync::Arc, time::Duration};

use coffer_client::{Client, ClientConfig, DenyAllUi};
use coffer_core::{
    access, database::encrypt_record, keys::KeySet, keys::Salts, LocalStore, MemoryStore,
};
use coffer_crypto::{aead, dh, random, AesKey, DhSecret};
use coffer_proto::{
    bundle, Command, Response, ResponseBody, SaltsWire, ServerEvent, Transaction,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_tungstenite::tungstenite::Message;

const SEED: &[u8] = b"0123456789abcdef0123456789abcdef";

fn salts_wire() -> SaltsWire {
    SaltsWire {
        encryption_key_salt: bundle::to_base64(b"salt-enc"),
        dh_key_salt: bundle::to_base64(b"salt-dh"),
        hmac_key_salt: bundle::to_base64(b"salt-hmac"),
    }
}

fn user_keys() -> KeySet {
    KeySet::derive(SEED, &Salts::from_wire(&salts_wire()).unwrap()).unwrap()
}

fn response(request_id: &str, status: u16, data: Option<Value>) -> String {
    serde_json::to_string(&Response {
        request_id: request_id.to_string(),
        response: ResponseBody { status, data, message: None },
    })
    .unwrap()
}

fn event(event: &ServerEvent) -> String {
    serde_json::to_string(event).unwrap()
}

/// Scripted server: accepts one socket and answers the protocol until the
/// client disconnects.
async fn run_server(listener: TcpListener, server_secret: DhSecret, db_key: AesKey) {
    let (stream, _) = listener.accept().await.expect("accept");
    let socket = tokio_tungstenite::accept_async(stream).await.expect("ws handshake");
    let (mut sink, mut source) = socket.split();

    let keys = user_keys();
    let shared = dh::shared_key(&server_secret, &keys.dh.public_key()).unwrap();
    let nonce = b"integration-nonce";

    sink.send(Message::Text(event(&ServerEvent::Connection {
        salts: salts_wire(),
        encrypted_validation_message: bundle::to_base64(&aead::encrypt(&shared, nonce)),
    })))
    .await
    .unwrap();

    let mut seq_no = 0u64;
    while let Some(Ok(message)) = source.next().await {
        let Message::Text(text) = message else { continue };
        let request: Value = serde_json::from_str(&text).unwrap();
        let request_id = request["requestId"].as_str().unwrap().to_string();

        match request["action"].as_str().unwrap() {
            "ValidateKey" => {
                let echoed =
                    bundle::from_base64(request["params"]["validationMessage"].as_str().unwrap())
                        .unwrap();
                assert_eq!(echoed, nonce, "client must prove possession of the derived key");
                sink.send(Message::Text(response(&request_id, 200, None))).await.unwrap();
            },
            "GetRequestsForSeed" => {
                sink.send(Message::Text(response(
                    &request_id,
                    200,
                    Some(json!({"seedRequests": []})),
                )))
                .await
                .unwrap();
            },
            "OpenDatabase" => {
                let db_name_hash =
                    request["params"]["dbNameHash"].as_str().unwrap().to_string();
                sink.send(Message::Text(response(&request_id, 200, None))).await.unwrap();

                // First push: wrapped key, no bundle, empty log.
                sink.send(Message::Text(event(&ServerEvent::ApplyTransactions {
                    db_id: "db-int".to_string(),
                    db_name_hash: Some(db_name_hash),
                    db_key: Some(access::wrap_db_key(&keys.encryption, &db_key)),
                    bundle: None,
                    bundle_seq_no: None,
                    transaction_log: vec![],
                })))
                .await
                .unwrap();
            },
            "Insert" => {
                // Order the transaction, acknowledge, then push it back as
                // the log entry — the single source of truth.
                seq_no += 1;
                sink.send(Message::Text(response(&request_id, 200, None))).await.unwrap();
                sink.send(Message::Text(event(&ServerEvent::ApplyTransactions {
                    db_id: "db-int".to_string(),
                    db_name_hash: None,
                    db_key: None,
                    bundle: None,
                    bundle_seq_no: None,
                    transaction_log: vec![Transaction {
                        seq_no,
                        command: Command::Insert,
                        item_id: Some(format!("item-{seq_no}")),
                        record: Some(
                            encrypt_record(&db_key, &json!({"item": format!("Item {seq_no}")}))
                                .unwrap(),
                        ),
                        operations: None,
                    }],
                })))
                .await
                .unwrap();
            },
            "SignOut" => {
                sink.send(Message::Text(response(&request_id, 200, None))).await.unwrap();
                break;
            },
            other => panic!("unexpected action from client: {other}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_open_insert_and_observe_changes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_secret = DhSecret::generate();
    let server_public = server_secret.public_key();
    let db_key = random::generate_key();
    let server = tokio::spawn(run_server(listener, server_secret, db_key));

    let store = MemoryStore::new();
    store.save_seed("alice", &bundle::to_base64(SEED)).unwrap();

    let mut config = ClientConfig::new(format!("http://127.0.0.1:{port}"), "app-test", "alice");
    config.server_public_key = server_public;

    let client =
        Client::connect(config.clone(), store.clone(), Arc::new(DenyAllUi)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.ready())
        .await
        .expect("ready should not hang")
        .expect("validation should succeed");

    // The session id was persisted for reuse.
    assert!(store.get_session("alice").unwrap().is_some());

    // Exactly one live connection per process: the registry rejects a
    // second connect before it touches the network.
    let second = Client::connect(config, store.clone(), Arc::new(DenyAllUi)).await;
    assert!(matches!(second, Err(coffer_core::Error::AlreadyConnected)));

    let (changes_tx, mut changes_rx) = mpsc::unbounded_channel();
    client
        .open_database("todos", move |items| {
            let _ = changes_tx.send(items);
        })
        .await
        .unwrap();

    // Initial (empty) state arrives with the first push.
    let initial = tokio::time::timeout(Duration::from_secs(5), changes_rx.recv())
        .await
        .expect("first change should arrive")
        .unwrap();
    assert!(initial.is_empty());

    // A write resolves on the server ack and lands via the push.
    client.insert("todos", "ignored-by-test-server", json!({"x": 1})).await.unwrap();
    let after_insert = tokio::time::timeout(Duration::from_secs(5), changes_rx.recv())
        .await
        .expect("change push should arrive")
        .unwrap();
    assert_eq!(after_insert.len(), 1);
    assert_eq!(after_insert[0].item_id, "item-1");
    assert_eq!(after_insert[0].record["item"], "Item 1");

    // Sign-out closes both sides cleanly.
    client.sign_out().await.unwrap();
    assert!(store.get_session("alice").unwrap().is_none());

    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server task should finish")
        .unwrap();
}
