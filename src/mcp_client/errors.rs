//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
///
/// Every variant carries plain data so a failure can be cloned into an
/// [`ExecutionResult`](super::types::ExecutionResult) and compared in tests.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum McpError {
    /// Configuration could not be read or an entry is malformed.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// A server could not be reached or its process could not be started.
    #[error("failed to connect to server '{server}': {reason}")]
    ConnectionError {
        server: String,
        reason: String,
    },

    /// A server descriptor names neither an endpoint nor a launch command.
    #[error("server '{server}' is invalid: {reason}")]
    ServerInvalid {
        server: String,
        reason: String,
    },

    /// No transport could be identified for an endpoint.
    #[error("could not detect protocol for server '{server}': {reason}")]
    ProtocolDetectionFailed {
        server: String,
        reason: String,
    },

    /// No response arrived for a request within its timeout.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Tool not found in the aggregated catalog.
    #[error("unknown tool: '{name}'")]
    ToolNotFound {
        name: String,
    },

    /// A required argument is absent.
    #[error("missing required parameter '{parameter}' for tool '{tool}'")]
    MissingParameter {
        tool: String,
        parameter: String,
    },

    /// An argument's JSON type disagrees with the declared schema type.
    #[error("parameter '{parameter}' for tool '{tool}' expected {expected}, got {actual}")]
    TypeMismatch {
        tool: String,
        parameter: String,
        expected: String,
        actual: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ExecutionError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// The connection closed while a request was outstanding or being sent.
    #[error("server '{server}' disconnected: {reason}")]
    Disconnected {
        server: String,
        reason: String,
    },

    /// No configuration exists for the requested server id.
    #[error("no configuration for server '{server}'")]
    UnknownServer {
        server: String,
    },

    /// All restart attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted {
        name: String,
        attempts: u32,
    },
}

impl McpError {
    /// Whether this error means the connection itself is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, McpError::Disconnected { .. })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
