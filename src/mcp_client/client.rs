//! High-level client: the interface collaborators use.
//!
//! Owns the server registry, the tool catalog and the execution engine, and
//! exposes the upward interface: connect, discover, search, execute,
//! disconnect.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use super::catalog::{DiscoveryReport, ToolCatalog};
use super::config::{load_config, load_config_file, ConfigSource};
use super::errors::McpError;
use super::executor::ExecutionEngine;
use super::lifecycle::ServerRegistry;
use super::transport::NotificationHandler;
use super::types::{ConnectionInfo, ExecutionResult, ServerDescriptor, ToolDescriptor, TransportKind};

// ─── McpClient ───────────────────────────────────────────────────────────────

pub struct McpClient {
    registry: Arc<ServerRegistry>,
    catalog: Arc<ToolCatalog>,
    engine: ExecutionEngine,
}

impl McpClient {
    pub fn new(descriptors: Vec<ServerDescriptor>) -> Self {
        let registry = Arc::new(ServerRegistry::new(descriptors));
        let catalog = Arc::new(ToolCatalog::new());
        Self {
            engine: ExecutionEngine::new(catalog.clone(), registry.clone()),
            registry,
            catalog,
        }
    }

    /// Build from a config file. Unreadable or malformed files give a client
    /// with no servers.
    pub fn from_config_file(path: &Path) -> Self {
        Self::new(load_config_file(path))
    }

    pub fn from_source(source: &ConfigSource) -> Result<Self, McpError> {
        Ok(Self::new(load_config(source)?))
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    // ─── Connections ─────────────────────────────────────────────────────

    pub async fn connect(&self, server_id: &str) -> Result<TransportKind, McpError> {
        self.registry.connect(server_id).await
    }

    /// Connect every configured server. Returns the ones that failed.
    pub async fn connect_all(&self) -> Vec<(String, McpError)> {
        self.registry.connect_all().await
    }

    /// Disconnect one server and drop its tools from the catalog.
    pub async fn disconnect(&self, server_id: &str) -> bool {
        let removed = self.catalog.remove_server(server_id);
        if removed > 0 {
            tracing::debug!(server = %server_id, tools = removed, "tools withdrawn");
        }
        self.registry.disconnect(server_id).await
    }

    /// Disconnect everything and empty the catalog.
    pub async fn disconnect_all(&self) {
        self.catalog.clear();
        self.registry.disconnect_all().await;
    }

    /// Restart a server with backoff. Its tools are withdrawn until the next
    /// discovery.
    pub async fn restart(&self, server_id: &str) -> Result<TransportKind, McpError> {
        self.catalog.remove_server(server_id);
        self.registry.restart(server_id).await
    }

    /// Subscribe to a server-pushed notification.
    ///
    /// Returns `Ok(false)` when the server's transport cannot deliver them.
    pub async fn on_notification(
        &self,
        server_id: &str,
        method: &str,
        handler: NotificationHandler,
    ) -> Result<bool, McpError> {
        let client = self.registry.client(server_id).await?;
        Ok(client.register_notification_handler(method, handler))
    }

    pub async fn status(&self) -> Vec<ConnectionInfo> {
        self.registry.status().await
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    pub async fn discover_all(&self) -> DiscoveryReport {
        self.catalog.discover_all(&self.registry).await
    }

    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.catalog.list()
    }

    pub fn find_by_keyword<S: AsRef<str>>(&self, terms: &[S]) -> Vec<ToolDescriptor> {
        self.catalog.find_by_keyword(terms)
    }

    pub async fn execute(&self, tool_name: &str, arguments: Value) -> Result<ExecutionResult, McpError> {
        self.engine.execute(tool_name, arguments).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::test_support::{FakeHttp, FakeHttpConfig, MockTransport};
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_from_config_file_tolerates_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ not json").unwrap();
        let client = McpClient::from_config_file(file.path());
        assert!(client.list_tools().is_empty());
    }

    #[tokio::test]
    async fn test_status_lists_configured_servers() {
        let source = ConfigSource::Json(
            r#"{"a": {"endpoint": "ws://x"}, "b": {"launchCommand": "tool-server"}}"#.into(),
        );
        let client = McpClient::from_source(&source).unwrap();
        let status = client.status().await;
        assert_eq!(status.len(), 2);
        assert!(status.iter().all(|s| !s.connected && s.transport.is_none()));
    }

    #[tokio::test]
    async fn test_end_to_end_request_response() {
        let server = FakeHttp::spawn(FakeHttpConfig {
            event_stream: false,
            announce_endpoint: false,
            replies_on_stream: false,
        })
        .await;
        let source = ConfigSource::Json(
            json!({"mcpServers": {"rpc": {
                "endpoint": format!("{}/jsonrpc", server.base),
                "transport": "request_response"
            }}})
            .to_string(),
        );
        let client = McpClient::from_source(&source).unwrap();

        assert!(client.connect_all().await.is_empty());
        let report = client.discover_all().await;
        assert_eq!(report.tools.len(), 2);

        let result = client.execute("search", json!({"q": "rust"})).await.unwrap();
        assert!(result.success);
        assert_eq!(result.value.unwrap()["content"][0]["text"], "rust");

        let err = client.execute("fetch", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::MissingParameter { ref parameter, .. } if parameter == "url"));

        let status = client.status().await;
        assert!(status[0].initialized);
        client.disconnect_all().await;
        assert!(client.list_tools().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_withdraws_tools() {
        let client = McpClient::new(vec![
            ServerDescriptor::with_command("a", "srv", &[]),
            ServerDescriptor::with_command("b", "srv", &[]),
        ]);
        let record = json!({"name": "search", "description": "Search"});
        client
            .registry()
            .attach("a", MockTransport::new("a", vec![record.clone()]).into_arc())
            .await
            .unwrap();
        client
            .registry()
            .attach("b", MockTransport::new("b", vec![record]).into_arc())
            .await
            .unwrap();
        client.discover_all().await;
        assert_eq!(client.find_by_keyword(&["SEARCH"]).len(), 2);

        assert!(client.disconnect("b").await);
        let names: Vec<_> = client.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["search"]);
    }

    #[tokio::test]
    async fn test_notifications_unsupported_on_mock() {
        let client = McpClient::new(vec![ServerDescriptor::with_command("a", "srv", &[])]);
        client
            .registry()
            .attach("a", MockTransport::new("a", vec![]).into_arc())
            .await
            .unwrap();
        let accepted = client
            .on_notification("a", "notifications/tools/list_changed", Arc::new(|_: Option<Value>| {}))
            .await
            .unwrap();
        assert!(!accepted);
        assert!(client.on_notification("zzz", "x", Arc::new(|_: Option<Value>| {})).await.is_err());
    }
}
