//! MCP client: JSON-RPC tool servers over pipes, sockets and HTTP.
//!
//! This module handles:
//! - Loading server descriptors from JSON/YAML config
//! - Detecting which transport an unfamiliar server speaks
//! - Stdio, WebSocket, SSE and plain HTTP transports behind one contract
//! - Tool discovery and aggregation across all servers
//! - Argument validation and tool call dispatch
//!
//! [`McpClient`] is the entry point for collaborators.

pub mod catalog;
pub mod client;
pub mod config;
pub mod detector;
pub mod errors;
pub mod executor;
pub mod lifecycle;
pub mod schema;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use catalog::{DiscoveryReport, ToolCatalog};
pub use client::McpClient;
pub use config::{load_config, load_config_file, ConfigSource};
pub use detector::{Detection, Detector};
pub use errors::McpError;
pub use executor::ExecutionEngine;
pub use lifecycle::ServerRegistry;
pub use transport::{NotificationHandler, TransportClient};
pub use types::{
    ConnectionInfo, ExecutionResult, ServerDescriptor, ServerFamily, ToolDescriptor, TransportKind,
};
