//! Test doubles shared by the transport, detector, catalog and executor tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::errors::McpError;
use super::transport::TransportClient;
use super::types::TransportKind;

// ─── Canned tool server ──────────────────────────────────────────────────────

/// Answer a JSON-RPC request the way a small tool server would.
///
/// Notifications get `None`.
pub fn tool_reply(request: &Value) -> Option<Value> {
    let id = request.get("id")?.clone();
    let method = request.get("method")?.as_str()?;
    let result = match method {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "fake", "version": "0.0.1"}
        }),
        "tools/list" => json!({"tools": [
            {
                "name": "search",
                "description": "Search the web",
                "inputSchema": {
                    "type": "object",
                    "properties": {"q": {"type": "string"}},
                    "required": ["q"]
                }
            },
            {
                "name": "fetch",
                "description": "Fetch a URL",
                "inputSchema": {
                    "type": "object",
                    "properties": {"url": {"type": "string"}},
                    "required": ["url"]
                }
            }
        ]}),
        "tools/call" => json!({
            "content": [{"type": "text", "text": request["params"]["arguments"]["q"]}]
        }),
        _ => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "Method not found"}
            }))
        }
    };
    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

// ─── Loopback HTTP server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct FakeHttpConfig {
    /// Serve `GET /sse` as an event stream (404 otherwise).
    pub event_stream: bool,
    /// Send an `endpoint` event naming `/messages/?session_id=abc123`.
    pub announce_endpoint: bool,
    /// Answer POSTs with 202 and push the response onto the stream.
    pub replies_on_stream: bool,
}

/// Minimal HTTP/1.1 server speaking JSON-RPC over POST and SSE.
pub struct FakeHttp {
    pub base: String,
    posts: Arc<StdMutex<Vec<String>>>,
}

type StreamSender = Arc<StdMutex<Option<mpsc::UnboundedSender<String>>>>;

impl FakeHttp {
    pub async fn spawn(config: FakeHttpConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let posts = Arc::new(StdMutex::new(Vec::new()));
        let stream: StreamSender = Arc::new(StdMutex::new(None));

        let recorded = posts.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(handle_connection(tcp, config, recorded.clone(), stream.clone()));
            }
        });

        Self { base, posts }
    }

    /// Request paths (with query) of every POST received so far.
    pub fn posted_paths(&self) -> Vec<String> {
        self.posts.lock().unwrap().clone()
    }
}

async fn write_response(write: &mut OwnedWriteHalf, status: &str, content_type: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\n\r\n{body}",
        body.len()
    );
    let _ = write.write_all(response.as_bytes()).await;
    let _ = write.flush().await;
}

async fn write_chunk(write: &mut OwnedWriteHalf, data: &str) -> std::io::Result<()> {
    write
        .write_all(format!("{:x}\r\n{data}\r\n", data.len()).as_bytes())
        .await?;
    write.flush().await
}

async fn handle_connection(
    tcp: TcpStream,
    config: FakeHttpConfig,
    posts: Arc<StdMutex<Vec<String>>>,
    stream: StreamSender,
) {
    let (read, mut write) = tcp.into_split();
    let mut reader = BufReader::new(read);

    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
            return;
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        let mut content_length = 0usize;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).await.unwrap_or(0) == 0 {
                return;
            }
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }
        let mut body = vec![0u8; content_length];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }

        if method == "GET" {
            if !(config.event_stream && path.starts_with("/sse")) {
                write_response(&mut write, "404 Not Found", "text/plain", "not found").await;
                continue;
            }
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            *stream.lock().unwrap() = Some(tx);
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                        cache-control: no-cache\r\ntransfer-encoding: chunked\r\n\r\n";
            if write.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            let _ = write_chunk(&mut write, ": connected\n\n").await;
            if config.announce_endpoint {
                let _ = write_chunk(
                    &mut write,
                    "event: endpoint\ndata: /messages/?session_id=abc123\n\n",
                )
                .await;
            }
            while let Some(event) = rx.recv().await {
                if write_chunk(&mut write, &event).await.is_err() {
                    return;
                }
            }
            return;
        }

        posts.lock().unwrap().push(path.clone());
        let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        match tool_reply(&request) {
            Some(reply) if config.replies_on_stream => {
                let sender = stream.lock().unwrap().clone();
                if let Some(sender) = sender {
                    let _ = sender.send(format!("event: message\ndata: {reply}\n\n"));
                }
                write_response(&mut write, "202 Accepted", "text/plain", "").await;
            }
            Some(reply) => {
                write_response(&mut write, "200 OK", "application/json", &reply.to_string()).await
            }
            None => write_response(&mut write, "202 Accepted", "text/plain", "").await,
        }
    }
}

// ─── Mock transport client ───────────────────────────────────────────────────

/// In-memory `TransportClient` with canned tools and call results.
pub struct MockTransport {
    server_id: String,
    tools: Vec<Value>,
    list_error: Option<McpError>,
    call_result: Result<Value, McpError>,
    calls: StdMutex<Vec<(String, Value)>>,
    connected: AtomicBool,
    initialized: AtomicBool,
}

impl MockTransport {
    pub fn new(server_id: &str, tools: Vec<Value>) -> Self {
        Self {
            server_id: server_id.to_string(),
            tools,
            list_error: None,
            call_result: Ok(json!({"content": [{"type": "text", "text": "ok"}]})),
            calls: StdMutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn failing_list(mut self, error: McpError) -> Self {
        self.list_error = Some(error);
        self
    }

    pub fn with_call_result(mut self, result: Result<Value, McpError>) -> Self {
        self.call_result = result;
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl TransportClient for MockTransport {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    async fn connect(&self) -> Result<(), McpError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn initialize_session(&self) -> Result<Value, McpError> {
        self.initialized.store(true, Ordering::Release);
        Ok(json!({"tools": {}}))
    }

    async fn list_tools(&self) -> Result<Vec<Value>, McpError> {
        match &self.list_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.tools.clone()),
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.calls.lock().unwrap().push((name.to_string(), arguments));
        self.call_result.clone()
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}
