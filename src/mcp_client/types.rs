//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, server descriptors, and the tool/execution
//! records handed to callers.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use super::errors::McpError;
use super::schema::InputSchema;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// Correlation id of a JSON-RPC request. Servers may echo numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id)
    }
}

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: impl Into<RequestId>, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A message received from a server, sorted by shape.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// Carries an id plus `result` or `error`.
    Response(JsonRpcResponse),
    /// Carries a method and no id.
    Notification { method: String, params: Option<Value> },
    /// Carries a method and an id (server-initiated request).
    Request { id: RequestId, method: String },
    /// Anything else: log noise, banners, malformed frames.
    Other(Value),
}

impl InboundMessage {
    /// Classify a parsed JSON frame.
    pub fn classify(value: Value) -> Self {
        let has_id = value.get("id").is_some_and(|id| !id.is_null());
        let method = value.get("method").and_then(Value::as_str).map(String::from);

        match (method, has_id) {
            (Some(method), false) => InboundMessage::Notification {
                params: value.get("params").cloned(),
                method,
            },
            (Some(method), true) => match serde_json::from_value(value["id"].clone()) {
                Ok(id) => InboundMessage::Request { id, method },
                Err(_) => InboundMessage::Other(value),
            },
            (None, true) if value.get("result").is_some() || value.get("error").is_some() => {
                match serde_json::from_value::<JsonRpcResponse>(value.clone()) {
                    Ok(resp) => InboundMessage::Response(resp),
                    Err(_) => InboundMessage::Other(value),
                }
            }
            _ => InboundMessage::Other(value),
        }
    }

    /// Parse and classify a text frame. Non-JSON text becomes `Other`.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => Self::classify(value),
            Err(_) => InboundMessage::Other(Value::String(text.to_string())),
        }
    }
}

// ─── Transport Kinds ─────────────────────────────────────────────────────────

/// The wire transports a server can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Long-lived server-sent event stream plus a secondary POST channel.
    #[serde(alias = "sse")]
    EventStream,
    /// Bidirectional message socket.
    #[serde(alias = "websocket", alias = "ws")]
    Socket,
    /// Newline-delimited JSON over a child process's stdio.
    #[serde(alias = "stdio")]
    Pipe,
    /// One HTTP POST per request.
    #[serde(alias = "http")]
    RequestResponse,
    /// Detection found nothing usable.
    Unknown,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::EventStream => "event_stream",
            TransportKind::Socket => "socket",
            TransportKind::Pipe => "pipe",
            TransportKind::RequestResponse => "request_response",
            TransportKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ─── Method Names ────────────────────────────────────────────────────────────

/// Server families that disagree on protocol method names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerFamily {
    #[default]
    Standard,
    /// Older servers that list tools with `getTools`.
    Legacy,
}

/// Protocol method names used by a single server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodNames {
    pub initialize: String,
    /// Sent after a successful initialize. `None` skips the notification.
    pub initialized: Option<String>,
    pub list_tools: String,
    pub call_tool: String,
}

impl MethodNames {
    pub fn for_family(family: ServerFamily) -> Self {
        let standard = Self {
            initialize: "initialize".into(),
            initialized: Some("notifications/initialized".into()),
            list_tools: "tools/list".into(),
            call_tool: "tools/call".into(),
        };
        match family {
            ServerFamily::Standard => standard,
            ServerFamily::Legacy => Self {
                list_tools: "getTools".into(),
                ..standard
            },
        }
    }
}

impl Default for MethodNames {
    fn default() -> Self {
        Self::for_family(ServerFamily::Standard)
    }
}

// ─── Server Descriptor ───────────────────────────────────────────────────────

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One configured server. Immutable after loading; live handles are kept by
/// the registry alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescriptor {
    pub id: String,
    pub endpoint: Option<String>,
    pub launch_command: Option<String>,
    pub args: Vec<String>,
    pub description: Option<String>,
    pub env: HashMap<String, String>,
    /// Working directory for a launched process.
    pub cwd: Option<String>,
    /// Skips detection when set.
    pub transport: Option<TransportKind>,
    pub methods: MethodNames,
    pub request_timeout: Duration,
}

impl ServerDescriptor {
    /// A server reached over the network.
    pub fn with_endpoint(id: &str, endpoint: &str) -> Self {
        Self {
            endpoint: Some(endpoint.to_string()),
            ..Self::bare(id)
        }
    }

    /// A server launched as a child process.
    pub fn with_command(id: &str, command: &str, args: &[&str]) -> Self {
        Self {
            launch_command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Self::bare(id)
        }
    }

    /// A descriptor with no way to reach the server. Fails `validate`.
    pub fn bare(id: &str) -> Self {
        Self {
            id: id.to_string(),
            endpoint: None,
            launch_command: None,
            args: Vec::new(),
            description: None,
            env: HashMap::new(),
            cwd: None,
            transport: None,
            methods: MethodNames::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// At least one of endpoint or launch command must be present.
    pub fn validate(&self) -> Result<(), McpError> {
        let has_endpoint = self.endpoint.as_deref().is_some_and(|e| !e.trim().is_empty());
        let has_command = self
            .launch_command
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());

        if has_endpoint || has_command {
            Ok(())
        } else {
            Err(McpError::ServerInvalid {
                server: self.id.clone(),
                reason: "neither endpoint nor launch command is set".into(),
            })
        }
    }
}

// ─── Tool Records ────────────────────────────────────────────────────────────

/// A tool exposed by a connected server, as stored in the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    /// Catalog name; differs from `original_name` after collision renaming.
    pub name: String,
    /// Name the owning server knows the tool by.
    pub original_name: String,
    pub description: String,
    pub input_schema: Value,
    pub server_id: String,
    /// Extra fields from the server's record (annotations, title, ...).
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(skip)]
    pub schema: InputSchema,
}

impl ToolDescriptor {
    /// Build a descriptor from a raw `tools/list` record.
    ///
    /// Returns `None` when the record has no usable name.
    pub fn from_record(server_id: &str, record: &Value) -> Option<Self> {
        let obj = record.as_object()?;
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())?
            .to_string();

        let description = obj
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let input_schema = ["inputSchema", "input_schema", "parameters"]
            .iter()
            .find_map(|key| obj.get(*key).filter(|v| v.is_object()))
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {} }));

        let metadata = obj
            .iter()
            .filter(|(k, _)| {
                !matches!(
                    k.as_str(),
                    "name" | "description" | "inputSchema" | "input_schema" | "parameters"
                )
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Self {
            schema: InputSchema::parse(&input_schema),
            name: name.clone(),
            original_name: name,
            description,
            input_schema,
            server_id: server_id.to_string(),
            metadata,
        })
    }

    /// Function-calling JSON understood by OpenAI-compatible model APIs.
    pub fn to_openai_tool(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            }
        })
    }
}

/// Outcome of one dispatched tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub tool_name: String,
    pub server_id: String,
    pub success: bool,
    pub value: Option<Value>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<McpError>,
    #[serde(rename = "execution_time_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

fn serialize_error<S: Serializer>(error: &Option<McpError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

fn serialize_millis<S: Serializer>(elapsed: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(elapsed.as_millis() as u64)
}

/// Snapshot of one server's connection state.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub server_id: String,
    pub transport: Option<TransportKind>,
    pub connected: bool,
    pub initialized: bool,
    pub pending_requests: usize,
    pub connected_at: Option<chrono::DateTime<chrono::Utc>>,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Start of the implementation-defined server error range.
    pub const SERVER_ERROR: i64 = -32000;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
