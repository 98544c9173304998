//! JSON-RPC over a WebSocket.
//!
//! Requests are written as text frames. A background task reads every
//! inbound frame and routes responses to the pending table by id and
//! notifications to registered handlers, so many requests can be in flight
//! at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::pending::PendingTable;
use super::{dispatch_frame, encode, Exchange, NotificationHandler, Notifications, CONNECT_TIMEOUT};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, TransportKind,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Map an endpoint onto a `ws://` or `wss://` URL.
pub fn socket_url(server_id: &str, endpoint: &str) -> Result<String, McpError> {
    let endpoint = endpoint.trim();
    let candidate = if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        endpoint.to_string()
    } else if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{endpoint}")
    };

    url::Url::parse(&candidate)
        .map(|_| candidate)
        .map_err(|e| McpError::ServerInvalid {
            server: server_id.to_string(),
            reason: format!("invalid socket endpoint '{endpoint}': {e}"),
        })
}

/// Multiplexed JSON-RPC transport over a WebSocket connection.
pub struct WebSocketTransport {
    server_id: String,
    url: String,
    sink: Mutex<Option<WsSink>>,
    pending: Arc<PendingTable>,
    notifications: Arc<Notifications>,
    connected: Arc<AtomicBool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(server_id: &str, endpoint: &str) -> Result<Self, McpError> {
        Ok(Self {
            server_id: server_id.to_string(),
            url: socket_url(server_id, endpoint)?,
            sink: Mutex::new(None),
            pending: Arc::new(PendingTable::new(server_id)),
            notifications: Arc::new(Notifications::default()),
            connected: Arc::new(AtomicBool::new(false)),
            reader: StdMutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_text(&self, text: String) -> Result<(), McpError> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or_else(|| McpError::Disconnected {
            server: self.server_id.clone(),
            reason: "socket is not connected".into(),
        })?;
        sink.send(Message::Text(text))
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("failed to send frame: {e}"),
            })
    }

    fn set_reader(&self, handle: Option<JoinHandle<()>>) {
        let mut reader = self.reader.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = reader.take() {
            old.abort();
        }
        *reader = handle;
    }
}

/// Route inbound frames until the socket closes, then fail what is left.
async fn read_loop(
    server_id: String,
    mut stream: SplitStream<WsStream>,
    pending: Arc<PendingTable>,
    notifications: Arc<Notifications>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch_frame(&server_id, &text, &pending, &notifications),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => dispatch_frame(&server_id, text, &pending, &notifications),
                Err(_) => tracing::debug!(server = %server_id, "ignoring non-utf8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                tracing::info!(server = %server_id, frame = ?frame, "socket closed by server");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(server = %server_id, error = %e, "socket read failed");
                break;
            }
        }
    }

    connected.store(false, Ordering::Release);
    pending.cancel_all("socket closed");
}

#[async_trait]
impl Exchange for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn open(&self) -> Result<(), McpError> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let (stream, _response) =
            tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(self.url.as_str()))
                .await
                .map_err(|_| McpError::ConnectionError {
                    server: self.server_id.clone(),
                    reason: format!("timed out connecting to {}", self.url),
                })?
                .map_err(|e| McpError::ConnectionError {
                    server: self.server_id.clone(),
                    reason: format!("failed to connect to {}: {e}", self.url),
                })?;

        let (sink, stream) = stream.split();
        *self.sink.lock().await = Some(sink);
        self.pending.reopen();
        self.connected.store(true, Ordering::Release);

        let handle = tokio::spawn(read_loop(
            self.server_id.clone(),
            stream,
            self.pending.clone(),
            self.notifications.clone(),
            self.connected.clone(),
        ));
        self.set_reader(Some(handle));
        Ok(())
    }

    async fn request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let receiver = self.pending.register(request.id.clone(), &request.method, timeout)?;

        let sent = match encode(&self.server_id, &request) {
            Ok(json) => self.send_text(json).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.pending.remove(&request.id);
            return Err(e);
        }

        self.pending.wait(&request.id, receiver, &request.method, timeout).await
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        let json = encode(&self.server_id, &notification)?;
        self.send_text(json).await
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        self.set_reader(None);
        self.pending.cancel_all("disconnected by client");
    }

    fn is_open(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn register_notification_handler(&self, method: &str, handler: NotificationHandler) -> bool {
        self.notifications.register(method, handler);
        true
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
