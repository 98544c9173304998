//! Transport clients.
//!
//! Every transport implements the same contract ([`TransportClient`]). The
//! JSON-RPC envelope, id allocation, session initialization, tool listing and
//! result extraction live once in [`RpcClient`]; each wire only supplies an
//! [`Exchange`] that moves one request to the server and its response back.

pub mod http;
pub mod pending;
pub mod sse;
pub mod stdio;
pub mod websocket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{
    InboundMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MethodNames,
    RequestId, ServerDescriptor, TransportKind,
};
use pending::PendingTable;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol revision announced during initialize.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Timeout for establishing a network connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on `nextCursor` pages followed in one listing.
const MAX_LIST_PAGES: usize = 64;

// ─── Contracts ───────────────────────────────────────────────────────────────

/// Callback for server-pushed notifications (`method` without `id`).
pub type NotificationHandler = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// The contract every transport client fulfils.
#[async_trait]
pub trait TransportClient: Send + Sync {
    fn server_id(&self) -> &str;

    fn kind(&self) -> TransportKind;

    /// Establish the underlying connection or start the process.
    async fn connect(&self) -> Result<(), McpError>;

    /// Perform the initialize handshake and return the server's capabilities.
    async fn initialize_session(&self) -> Result<Value, McpError>;

    /// Raw tool records as reported by the server.
    async fn list_tools(&self) -> Result<Vec<Value>, McpError>;

    /// Invoke a tool. A JSON-RPC error envelope becomes `ExecutionError`.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError>;

    /// Close the connection, cancel pending requests, stop any process.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn is_initialized(&self) -> bool;

    fn pending_requests(&self) -> usize {
        0
    }

    /// Returns `false` when the transport cannot receive notifications.
    fn register_notification_handler(&self, _method: &str, _handler: NotificationHandler) -> bool {
        false
    }
}

/// One wire's way of moving JSON-RPC messages.
#[async_trait]
pub trait Exchange: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn open(&self) -> Result<(), McpError>;

    /// Send `request` and return the response carrying the same id.
    async fn request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError>;

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError>;

    async fn close(&self);

    fn is_open(&self) -> bool;

    fn pending_requests(&self) -> usize {
        0
    }

    fn register_notification_handler(&self, _method: &str, _handler: NotificationHandler) -> bool {
        false
    }
}

// ─── RpcClient ───────────────────────────────────────────────────────────────

/// JSON-RPC session logic shared by all transports.
pub struct RpcClient<E> {
    server_id: String,
    methods: MethodNames,
    timeout: Duration,
    exchange: E,
    next_id: AtomicU64,
    session: Mutex<Option<Value>>,
    initialized: AtomicBool,
}

pub type StdioClient = RpcClient<StdioTransport>;
pub type WebSocketClient = RpcClient<WebSocketTransport>;
pub type SseClient = RpcClient<SseTransport>;
pub type HttpClient = RpcClient<HttpTransport>;

impl<E: Exchange> RpcClient<E> {
    pub fn new(descriptor: &ServerDescriptor, exchange: E) -> Self {
        Self {
            server_id: descriptor.id.clone(),
            methods: descriptor.methods.clone(),
            timeout: descriptor.request_timeout,
            exchange,
            next_id: AtomicU64::new(1),
            session: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Send a request with a fresh id and return the raw response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let request = JsonRpcRequest::new(self.next_request_id(), method, params);
        tracing::debug!(server = %self.server_id, id = %request.id, method, "sending request");
        self.exchange.request(request, self.timeout).await
    }
}

#[async_trait]
impl<E: Exchange> TransportClient for RpcClient<E> {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn kind(&self) -> TransportKind {
        self.exchange.kind()
    }

    async fn connect(&self) -> Result<(), McpError> {
        self.exchange.open().await?;
        tracing::info!(server = %self.server_id, transport = %self.kind(), "connected");
        Ok(())
    }

    async fn initialize_session(&self) -> Result<Value, McpError> {
        let mut session = self.session.lock().await;
        if let Some(capabilities) = session.as_ref() {
            return Ok(capabilities.clone());
        }

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let response = self.request(&self.methods.initialize, Some(params)).await?;
        let result = extract_result(response)?;

        if let Some(method) = &self.methods.initialized {
            if let Err(e) = self.exchange.notify(JsonRpcNotification::new(method, None)).await {
                tracing::warn!(server = %self.server_id, error = %e, "initialized notification failed");
            }
        }

        let capabilities = result.get("capabilities").cloned().unwrap_or_default();
        let server_info = result.get("serverInfo").cloned().unwrap_or_default();
        tracing::info!(server = %self.server_id, server_info = %server_info, "session initialized");
        *session = Some(capabilities.clone());
        self.initialized.store(true, Ordering::Release);
        Ok(capabilities)
    }

    async fn list_tools(&self) -> Result<Vec<Value>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let response = self.request(&self.methods.list_tools, params).await?;
            let result = extract_result(response)?;

            let page = match result {
                Value::Array(items) => {
                    tools.extend(items);
                    return Ok(tools);
                }
                other => other,
            };

            match page.get("tools") {
                Some(Value::Array(items)) => tools.extend(items.iter().cloned()),
                Some(_) | None => {
                    return Err(McpError::TransportError {
                        server: self.server_id.clone(),
                        reason: "tool listing has no 'tools' array".into(),
                    })
                }
            }

            let next = page
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(String::from);
            if next.is_none() || next == cursor {
                return Ok(tools);
            }
            cursor = next;
        }

        tracing::warn!(server = %self.server_id, pages = MAX_LIST_PAGES, "tool listing truncated");
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let params = json!({ "name": name, "arguments": arguments });
        let response = self.request(&self.methods.call_tool, Some(params)).await?;
        extract_result(response)
    }

    async fn disconnect(&self) {
        self.exchange.close().await;
        *self.session.lock().await = None;
        self.initialized.store(false, Ordering::Release);
        tracing::info!(server = %self.server_id, "disconnected");
    }

    fn is_connected(&self) -> bool {
        self.exchange.is_open()
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn pending_requests(&self) -> usize {
        self.exchange.pending_requests()
    }

    fn register_notification_handler(&self, method: &str, handler: NotificationHandler) -> bool {
        self.exchange.register_notification_handler(method, handler)
    }
}

// ─── Client Factory ──────────────────────────────────────────────────────────

/// Build an unconnected client of the given kind for `descriptor`.
///
/// `endpoint` overrides the descriptor's endpoint (the detector may have
/// found the server answering on a derived URL).
pub fn build_client(
    descriptor: &ServerDescriptor,
    kind: TransportKind,
    endpoint: Option<&str>,
    http: &reqwest::Client,
) -> Result<Arc<dyn TransportClient>, McpError> {
    let endpoint = endpoint.or(descriptor.endpoint.as_deref());
    let require_endpoint = || {
        endpoint.ok_or_else(|| McpError::ServerInvalid {
            server: descriptor.id.clone(),
            reason: format!("{kind} transport requires an endpoint"),
        })
    };

    let client: Arc<dyn TransportClient> = match kind {
        TransportKind::Pipe => {
            let exchange = StdioTransport::from_descriptor(descriptor)?;
            Arc::new(RpcClient::new(descriptor, exchange))
        }
        TransportKind::Socket => {
            let exchange = WebSocketTransport::new(&descriptor.id, require_endpoint()?)?;
            Arc::new(RpcClient::new(descriptor, exchange))
        }
        TransportKind::EventStream => {
            let exchange = SseTransport::new(&descriptor.id, require_endpoint()?, http.clone())?;
            Arc::new(RpcClient::new(descriptor, exchange))
        }
        TransportKind::RequestResponse => {
            let exchange = HttpTransport::new(&descriptor.id, require_endpoint()?, http.clone())?;
            Arc::new(RpcClient::new(descriptor, exchange))
        }
        TransportKind::Unknown => {
            return Err(McpError::ProtocolDetectionFailed {
                server: descriptor.id.clone(),
                reason: "no transport identified".into(),
            })
        }
    };
    Ok(client)
}

// ─── Inbound Routing ─────────────────────────────────────────────────────────

/// Registered notification callbacks, keyed by method.
#[derive(Default)]
pub struct Notifications {
    handlers: RwLock<HashMap<String, NotificationHandler>>,
}

impl Notifications {
    pub fn register(&self, method: &str, handler: NotificationHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.insert(method.to_string(), handler);
    }

    fn handler(&self, method: &str) -> Option<NotificationHandler> {
        let handlers = self.handlers.read().unwrap_or_else(|p| p.into_inner());
        handlers.get(method).cloned()
    }
}

/// Route one inbound text frame from a multiplexed connection.
pub(crate) fn dispatch_frame(
    server_id: &str,
    text: &str,
    pending: &PendingTable,
    notifications: &Notifications,
) {
    match InboundMessage::parse(text) {
        InboundMessage::Response(response) => {
            let id = response.id.clone();
            if !pending.resolve(response) {
                tracing::warn!(
                    server = server_id,
                    id = ?id,
                    "discarding response with no matching request"
                );
            }
        }
        InboundMessage::Notification { method, params } => match notifications.handler(&method) {
            Some(handler) => handler(params),
            None => tracing::debug!(server = server_id, method = %method, "unhandled notification"),
        },
        InboundMessage::Request { id, method } => {
            tracing::debug!(server = server_id, id = %id, method = %method, "ignoring server request");
        }
        InboundMessage::Other(value) => {
            tracing::debug!(server = server_id, frame = %value, "ignoring unrecognised frame");
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ExecutionError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ExecutionError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

/// Serialize any outbound message, mapping failures to `TransportError`.
pub(crate) fn encode<T: serde::Serialize>(server_id: &str, message: &T) -> Result<String, McpError> {
    serde_json::to_string(message).map_err(|e| McpError::TransportError {
        server: server_id.to_string(),
        reason: format!("failed to serialize message: {e}"),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
