//! WebSocket transport.
//!
//! A thin layer that moves text frames between the socket and a pair of
//! channels — protocol logic stays in the sans-IO core. The hosting
//! application supplies an `http://` or `https://` base URL; the matching
//! `ws://`/`wss://` origin is derived here.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

/// Deadline for establishing the socket. The protocol-level handshake has
/// its own deadline in the core.
pub const SOCKET_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The base URL is not `http://` or `https://`.
    #[error("unsupported endpoint `{0}`: expected an http(s) URL")]
    InvalidEndpoint(String),

    /// Socket establishment failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The socket died after establishment.
    #[error("socket closed: {0}")]
    Closed(String),
}

/// Derive the WebSocket endpoint from the application's base URL.
///
/// `http://host[:port][/base]` becomes
/// `ws://host[:port][/base]/api?appId=…&sessionId=…`; `https` becomes
/// `wss`.
///
/// # Errors
///
/// [`TransportError::InvalidEndpoint`] for any other scheme.
pub fn endpoint_url(
    base_url: &str,
    app_id: &str,
    session_id: &str,
) -> Result<String, TransportError> {
    let trimmed = base_url.trim_end_matches('/');
    let origin = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(TransportError::InvalidEndpoint(base_url.to_string()));
    };
    Ok(format!("{origin}/api?appId={app_id}&sessionId={session_id}"))
}

/// Handle to an established socket.
///
/// Text frames flow through the channels; two internal tasks do the I/O.
/// Dropping the handle (or calling [`Transport::shutdown`]) aborts both.
pub struct Transport {
    /// Frames to the server.
    pub outbound: mpsc::Sender<String>,
    /// Frames from the server.
    pub inbound: mpsc::Receiver<String>,
    /// Receiving an error means the socket is dead.
    pub errors: mpsc::Receiver<TransportError>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Transport {
    /// Stop both I/O tasks.
    pub fn shutdown(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open the WebSocket and spawn the I/O tasks.
///
/// # Errors
///
/// [`TransportError::Connection`] on timeout or handshake failure.
pub async fn connect(url: &str) -> Result<Transport, TransportError> {
    let (socket, _response): (Socket, _) =
        tokio::time::timeout(SOCKET_CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| {
                TransportError::Connection(format!(
                    "socket connect timed out after {SOCKET_CONNECT_TIMEOUT:?}"
                ))
            })?
            .map_err(|e| TransportError::Connection(e.to_string()))?;

    let (mut sink, mut source) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(32);
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(32);
    let (error_tx, error_rx) = mpsc::channel::<TransportError>(1);

    let writer_errors = error_tx.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                let _ = writer_errors.send(TransportError::Closed(e.to_string())).await;
                break;
            }
        }
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if inbound_tx.send(text).await.is_err() {
                        break;
                    }
                },
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "server closed".to_string());
                    let _ = error_tx.send(TransportError::Closed(reason)).await;
                    break;
                },
                Ok(other) => {
                    debug!("ignoring non-text frame: {other:?}");
                },
                Err(e) => {
                    let _ = error_tx.send(TransportError::Closed(e.to_string())).await;
                    break;
                },
            }
        }
    });

    Ok(Transport { outbound: outbound_tx, inbound: inbound_rx, errors: error_rx, reader, writer })
}
