//! JSON-RPC over a server-sent event stream.
//!
//! The client holds one long-lived `GET` open with
//! `Accept: text/event-stream`. Requests go out as separate `POST`s:
//!
//! - to the URL announced by an `endpoint` event (e.g.
//!   `/messages/?session_id=…`, resolved against the stream URL), or
//! - to `<base>/jsonrpc` when the server announces nothing.
//!
//! A `202 Accepted` means the response will arrive on the stream and is
//! correlated through the pending table; a `200` with a JSON body is the
//! response itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use super::pending::PendingTable;
use super::{dispatch_frame, Exchange, NotificationHandler, Notifications, CONNECT_TIMEOUT};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{
    InboundMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, TransportKind,
};

/// How long `open` waits for the stream to announce its message endpoint.
const ENDPOINT_WAIT: Duration = Duration::from_secs(3);

// ─── SSE framing ─────────────────────────────────────────────────────────────

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Parse one event block (the text between blank lines).
///
/// Returns `None` for comments and keep-alives.
pub fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Split a streaming HTTP body into `SseEvent`s.
///
/// Bytes are buffered until a full block is present, so a multibyte
/// character split across chunks decodes intact.
pub fn event_stream(
    response: reqwest::Response,
    server_id: String,
) -> impl Stream<Item = Result<SseEvent, McpError>> {
    let byte_stream = response.bytes_stream();

    stream::unfold(
        (byte_stream, Vec::<u8>::new(), server_id),
        |(mut byte_stream, mut buffer, server_id)| async move {
            loop {
                // Check if we have a complete event in the buffer
                if let Some(event_end) = buffer.windows(2).position(|w| w == b"\n\n") {
                    let block: Vec<u8> = buffer.drain(..event_end + 2).collect();
                    match parse_event(&String::from_utf8_lossy(&block[..event_end])) {
                        Some(event) => return Some((Ok(event), (byte_stream, buffer, server_id))),
                        None => continue,
                    }
                }

                match byte_stream.next().await {
                    // CRLF line endings collapse to LF.
                    Some(Ok(bytes)) => buffer.extend(bytes.iter().filter(|&&b| b != b'\r')),
                    Some(Err(e)) => {
                        let err = McpError::Disconnected {
                            server: server_id.clone(),
                            reason: format!("event stream read error: {e}"),
                        };
                        return Some((Err(err), (byte_stream, buffer, server_id)));
                    }
                    None => {
                        let rest = std::mem::take(&mut buffer);
                        return parse_event(String::from_utf8_lossy(&rest).trim())
                            .map(|event| (Ok(event), (byte_stream, buffer, server_id)));
                    }
                }
            }
        },
    )
}

/// Where to POST when the stream announces no endpoint: `<base>/jsonrpc`,
/// with base being the stream URL minus a trailing `/sse`.
pub fn fallback_post_url(stream_url: &Url) -> Url {
    let mut url = stream_url.clone();
    let path = url.path().trim_end_matches('/').to_string();
    let base = path.strip_suffix("/sse").unwrap_or(&path);
    url.set_path(&format!("{base}/jsonrpc"));
    url.set_query(None);
    url
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Event-stream JSON-RPC transport with a POST request channel.
pub struct SseTransport {
    server_id: String,
    stream_url: Url,
    http: reqwest::Client,
    post_url: Arc<watch::Sender<Option<Url>>>,
    pending: Arc<PendingTable>,
    notifications: Arc<Notifications>,
    connected: Arc<AtomicBool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    endpoint_wait: Duration,
}

impl SseTransport {
    pub fn new(server_id: &str, endpoint: &str, http: reqwest::Client) -> Result<Self, McpError> {
        let stream_url = Url::parse(endpoint.trim()).map_err(|e| McpError::ServerInvalid {
            server: server_id.to_string(),
            reason: format!("invalid event-stream endpoint '{endpoint}': {e}"),
        })?;
        let (post_url, _) = watch::channel(None);

        Ok(Self {
            server_id: server_id.to_string(),
            stream_url,
            http,
            post_url: Arc::new(post_url),
            pending: Arc::new(PendingTable::new(server_id)),
            notifications: Arc::new(Notifications::default()),
            connected: Arc::new(AtomicBool::new(false)),
            reader: StdMutex::new(None),
            endpoint_wait: ENDPOINT_WAIT,
        })
    }

    /// Override how long `open` waits for an `endpoint` event.
    pub fn with_endpoint_wait(mut self, wait: Duration) -> Self {
        self.endpoint_wait = wait;
        self
    }

    /// The URL requests are currently posted to.
    pub fn post_url(&self) -> Option<Url> {
        self.post_url.borrow().clone()
    }

    fn set_reader(&self, handle: Option<JoinHandle<()>>) {
        let mut reader = self.reader.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = reader.take() {
            old.abort();
        }
        *reader = handle;
    }

    /// POST one message. `Ok(None)` means the answer comes on the stream.
    async fn post<T: serde::Serialize + Sync>(
        &self,
        message: &T,
        method: &str,
        timeout: Duration,
    ) -> Result<Option<JsonRpcResponse>, McpError> {
        let url = self.post_url().ok_or_else(|| McpError::Disconnected {
            server: self.server_id.clone(),
            reason: "no message endpoint; stream is not open".into(),
        })?;

        let response = self
            .http
            .post(url.clone())
            .json(message)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    McpError::RequestTimeout {
                        server: self.server_id.clone(),
                        method: method.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }
                } else {
                    McpError::TransportError {
                        server: self.server_id.clone(),
                        reason: format!("POST {url} failed: {e}"),
                    }
                }
            })?;

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("POST {url} returned {status}"),
            });
        }

        let body = response.text().await.map_err(|e| McpError::TransportError {
            server: self.server_id.clone(),
            reason: format!("failed to read POST response: {e}"),
        })?;
        match InboundMessage::parse(body.trim()) {
            InboundMessage::Response(resp) => Ok(Some(resp)),
            _ => Ok(None),
        }
    }
}

/// Apply an `endpoint` announcement.
fn set_endpoint(server_id: &str, stream_url: &Url, data: &str, post_url: &watch::Sender<Option<Url>>) {
    match stream_url.join(data.trim()) {
        Ok(url) => {
            tracing::info!(server = server_id, endpoint = %url, "message endpoint announced");
            post_url.send_replace(Some(url));
        }
        Err(e) => {
            tracing::warn!(server = server_id, data, error = %e, "unusable endpoint event");
        }
    }
}

/// Consume the stream until it ends, then fail what is left.
async fn read_loop(
    server_id: String,
    stream_url: Url,
    response: reqwest::Response,
    pending: Arc<PendingTable>,
    notifications: Arc<Notifications>,
    post_url: Arc<watch::Sender<Option<Url>>>,
    connected: Arc<AtomicBool>,
) {
    let mut events = Box::pin(event_stream(response, server_id.clone()));

    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(server = %server_id, error = %e, "event stream failed");
                break;
            }
        };

        let data = event.data.trim();
        let awaiting_endpoint = post_url.borrow().is_none();
        match event.event.as_deref() {
            Some("endpoint") => set_endpoint(&server_id, &stream_url, data, &post_url),
            _ if data.starts_with('{') => dispatch_frame(&server_id, data, &pending, &notifications),
            // Servers that skip the event name still send the path first.
            _ if data.starts_with('/') && awaiting_endpoint => {
                set_endpoint(&server_id, &stream_url, data, &post_url)
            }
            _ => tracing::debug!(server = %server_id, event = ?event.event, "ignoring event"),
        }
    }

    connected.store(false, Ordering::Release);
    pending.cancel_all("event stream closed");
}

#[async_trait]
impl Exchange for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }

    async fn open(&self) -> Result<(), McpError> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let request = self
            .http
            .get(self.stream_url.clone())
            .header(ACCEPT, "text/event-stream")
            .send();
        let response = tokio::time::timeout(CONNECT_TIMEOUT, request)
            .await
            .map_err(|_| McpError::ConnectionError {
                server: self.server_id.clone(),
                reason: format!("timed out opening {}", self.stream_url),
            })?
            .map_err(|e| McpError::ConnectionError {
                server: self.server_id.clone(),
                reason: format!("failed to open {}: {e}", self.stream_url),
            })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !status.is_success() || !content_type.contains("text/event-stream") {
            return Err(McpError::ConnectionError {
                server: self.server_id.clone(),
                reason: format!(
                    "{} is not an event stream (status {status}, content-type '{content_type}')",
                    self.stream_url
                ),
            });
        }

        self.post_url.send_replace(None);
        self.pending.reopen();
        self.connected.store(true, Ordering::Release);

        let mut announced = self.post_url.subscribe();
        let handle = tokio::spawn(read_loop(
            self.server_id.clone(),
            self.stream_url.clone(),
            response,
            self.pending.clone(),
            self.notifications.clone(),
            self.post_url.clone(),
            self.connected.clone(),
        ));
        self.set_reader(Some(handle));

        let got_endpoint = matches!(
            tokio::time::timeout(self.endpoint_wait, announced.wait_for(Option::is_some)).await,
            Ok(Ok(_))
        );
        if !got_endpoint {
            let fallback = fallback_post_url(&self.stream_url);
            tracing::info!(
                server = %self.server_id,
                endpoint = %fallback,
                "no endpoint announced; using fallback"
            );
            self.post_url.send_replace(Some(fallback));
        }
        Ok(())
    }

    async fn request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let started = Instant::now();
        let receiver = self.pending.register(request.id.clone(), &request.method, timeout)?;

        match self.post(&request, &request.method, timeout).await {
            Ok(Some(response)) if response.id.as_ref() == Some(&request.id) => {
                self.pending.remove(&request.id);
                Ok(response)
            }
            Ok(Some(other)) => {
                // Answer to someone else's request; hand it over and keep waiting.
                self.pending.resolve(other);
                let remaining = timeout.saturating_sub(started.elapsed());
                self.pending.wait(&request.id, receiver, &request.method, remaining).await
            }
            Ok(None) => {
                let remaining = timeout.saturating_sub(started.elapsed());
                self.pending.wait(&request.id, receiver, &request.method, remaining).await
            }
            Err(e) => {
                self.pending.remove(&request.id);
                Err(e)
            }
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        self.post(&notification, &notification.method, CONNECT_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.set_reader(None);
        self.post_url.send_replace(None);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::test_support::{FakeHttp, FakeHttpConfig};
    use crate::mcp_client::transport::{RpcClient, TransportClient};
    use crate::mcp_client::types::ServerDescriptor;
    use serde_json::json;

    #[test]
    fn test_parse_event_fields() {
        let event = parse_event("event: endpoint\ndata: /messages/?session_id=abc").unwrap();
        assert_eq!(event.event.as_deref(), Some("endpoint"));
        assert_eq!(event.data, "/messages/?session_id=abc");

        let event = parse_event("data: {\"a\":\ndata: 1}").unwrap();
        assert_eq!(event.data, "{\"a\":\n1}");

        assert!(parse_event(": keep-alive").is_none());
        assert!(parse_event("").is_none());
    }

    #[test]
    fn test_fallback_post_url() {
        let url = Url::parse("http://h:8000/sse").unwrap();
        assert_eq!(fallback_post_url(&url).as_str(), "http://h:8000/jsonrpc");
        let url = Url::parse("http://h/api/events/?x=1").unwrap();
        assert_eq!(fallback_post_url(&url).as_str(), "http://h/api/events/jsonrpc");
    }

    #[tokio::test]
    async fn test_multibyte_character_split_across_chunks() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut request).await;

            let event = "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"city\":\"Montréal\"}}\r\n\r\n";
            let bytes = event.as_bytes();
            // Split right after the first byte of 'é' (0xC3 0xA9).
            let split = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&bytes[..split]).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            socket.write_all(&bytes[split..]).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let response = reqwest::get(format!("http://{addr}/sse")).await.unwrap();
        let events: Vec<_> = event_stream(response, "split".into()).collect().await;
        assert_eq!(events.len(), 1);
        let event = events.into_iter().next().unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&event.data).unwrap();
        assert_eq!(value["result"]["city"], "Montréal");
    }

    #[tokio::test]
    async fn test_session_via_announced_endpoint() {
        let server = FakeHttp::spawn(FakeHttpConfig {
            event_stream: true,
            announce_endpoint: true,
            replies_on_stream: true,
        })
        .await;
        let url = format!("{}/sse", server.base);
        let descriptor = ServerDescriptor::with_endpoint("events", &url);
        let transport = SseTransport::new("events", &url, reqwest::Client::new()).unwrap();
        let client = RpcClient::new(&descriptor, transport);

        client.connect().await.unwrap();
        let post_url = client.exchange().post_url().unwrap();
        assert_eq!(post_url.path(), "/messages/");
        assert_eq!(post_url.query(), Some("session_id=abc123"));

        client.initialize_session().await.unwrap();
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);

        let result = client.call_tool("search", json!({"q": "sse"})).await.unwrap();
        assert_eq!(result["content"][0]["text"], "sse");
        assert!(server.posted_paths().iter().all(|p| p.starts_with("/messages/")));

        client.disconnect().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_fallback_endpoint_with_direct_replies() {
        let server = FakeHttp::spawn(FakeHttpConfig {
            event_stream: true,
            announce_endpoint: false,
            replies_on_stream: false,
        })
        .await;
        let url = format!("{}/sse", server.base);
        let descriptor = ServerDescriptor::with_endpoint("quiet", &url);
        let transport = SseTransport::new("quiet", &url, reqwest::Client::new())
            .unwrap()
            .with_endpoint_wait(Duration::from_millis(100));
        let client = RpcClient::new(&descriptor, transport);

        client.connect().await.unwrap();
        assert_eq!(client.exchange().post_url().unwrap().path(), "/jsonrpc");

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools[0]["name"], "search");
        assert_eq!(server.posted_paths(), vec!["/jsonrpc".to_string()]);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_non_stream_endpoint_is_rejected() {
        let server = FakeHttp::spawn(FakeHttpConfig {
            event_stream: false,
            announce_endpoint: false,
            replies_on_stream: false,
        })
        .await;
        let url = format!("{}/sse", server.base);
        let transport = SseTransport::new("plain", &url, reqwest::Client::new()).unwrap();
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionError { .. }));
    }
}
