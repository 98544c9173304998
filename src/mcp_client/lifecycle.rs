//! Server registry and connection lifecycle.
//!
//! Holds the configured [`ServerDescriptor`]s and, for each, at most one live
//! transport client. Connecting resolves a transport (explicit setting,
//! then the endpoint's detected transport), opens it, and falls back to the
//! launch command when the endpoint cannot be used.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::sleep;

use super::config::{load_config, ConfigSource};
use super::detector::Detector;
use super::errors::McpError;
use super::transport::{build_client, TransportClient};
use super::types::{ConnectionInfo, ServerDescriptor, TransportKind};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum restart attempts before giving up on a server.
const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Base delay between restart attempts (doubles each time).
const RESTART_BASE_DELAY: Duration = Duration::from_secs(1);

// ─── Registry ────────────────────────────────────────────────────────────────

/// A live connection attached to a server.
struct Connection {
    client: Arc<dyn TransportClient>,
    connected_at: DateTime<Utc>,
}

struct ServerSlot {
    descriptor: ServerDescriptor,
    connection: Option<Connection>,
    restart_count: u32,
}

impl ServerSlot {
    fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            connection: None,
            restart_count: 0,
        }
    }

    fn live_client(&self) -> Option<Arc<dyn TransportClient>> {
        self.connection
            .as_ref()
            .filter(|c| c.client.is_connected())
            .map(|c| c.client.clone())
    }
}

/// All configured servers and their live connections.
pub struct ServerRegistry {
    servers: RwLock<BTreeMap<String, ServerSlot>>,
    detector: Detector,
    http: reqwest::Client,
}

impl ServerRegistry {
    pub fn new(descriptors: Vec<ServerDescriptor>) -> Self {
        let http = reqwest::Client::new();
        let servers = descriptors
            .into_iter()
            .map(|d| (d.id.clone(), ServerSlot::new(d)))
            .collect();
        Self {
            servers: RwLock::new(servers),
            detector: Detector::new(http.clone()),
            http,
        }
    }

    pub fn with_detector(mut self, detector: Detector) -> Self {
        self.detector = detector;
        self
    }

    // ─── Configuration ───────────────────────────────────────────────────

    /// Load descriptors from `source`, replacing the configured set.
    ///
    /// Servers that disappear from the config are disconnected; servers that
    /// stay keep their live connection.
    pub async fn load_config(&self, source: &ConfigSource) -> Result<usize, McpError> {
        let descriptors = load_config(source)?;
        let count = descriptors.len();

        let removed: Vec<Arc<dyn TransportClient>> = {
            let mut servers = self.servers.write().await;
            let mut next: BTreeMap<String, ServerSlot> = BTreeMap::new();
            for descriptor in descriptors {
                let slot = match servers.remove(&descriptor.id) {
                    Some(mut slot) if slot.descriptor == descriptor => {
                        slot.descriptor = descriptor;
                        slot
                    }
                    Some(slot) => {
                        // Changed entry: keep it registered but drop the old link.
                        if let Some(conn) = slot.connection {
                            tokio::spawn(async move { conn.client.disconnect().await });
                        }
                        ServerSlot::new(descriptor)
                    }
                    None => ServerSlot::new(descriptor),
                };
                next.insert(slot.descriptor.id.clone(), slot);
            }
            let stale = std::mem::replace(&mut *servers, next);
            stale
                .into_values()
                .filter_map(|slot| slot.connection.map(|c| c.client))
                .collect()
        };

        for client in removed {
            tracing::info!(server = %client.server_id(), "server removed from config");
            client.disconnect().await;
        }
        Ok(count)
    }

    /// Add or replace one descriptor.
    pub async fn register(&self, descriptor: ServerDescriptor) {
        let previous = self
            .servers
            .write()
            .await
            .insert(descriptor.id.clone(), ServerSlot::new(descriptor));
        if let Some(conn) = previous.and_then(|slot| slot.connection) {
            conn.client.disconnect().await;
        }
    }

    pub async fn descriptor(&self, server_id: &str) -> Option<ServerDescriptor> {
        self.servers
            .read()
            .await
            .get(server_id)
            .map(|slot| slot.descriptor.clone())
    }

    pub async fn descriptors(&self) -> Vec<ServerDescriptor> {
        self.servers
            .read()
            .await
            .values()
            .map(|slot| slot.descriptor.clone())
            .collect()
    }

    // ─── Connecting ──────────────────────────────────────────────────────

    /// Connect to a configured server. Already-connected servers are left
    /// as they are.
    pub async fn connect(&self, server_id: &str) -> Result<TransportKind, McpError> {
        let descriptor = {
            let servers = self.servers.read().await;
            let slot = servers.get(server_id).ok_or_else(|| McpError::UnknownServer {
                server: server_id.to_string(),
            })?;
            if let Some(client) = slot.live_client() {
                return Ok(client.kind());
            }
            slot.descriptor.clone()
        };

        let client = self
            .open_connection(&descriptor)
            .await
            .map_err(|e| connection_error(server_id, e))?;
        let kind = client.kind();
        self.attach(server_id, client).await?;
        Ok(kind)
    }

    /// Connect every configured server concurrently.
    ///
    /// Returns the servers that failed (partial startup is acceptable).
    pub async fn connect_all(&self) -> Vec<(String, McpError)> {
        let ids: Vec<String> = self.servers.read().await.keys().cloned().collect();
        let attempts = ids.iter().map(|id| async move { (id.clone(), self.connect(id).await) });

        let mut errors = Vec::new();
        for (id, result) in futures::future::join_all(attempts).await {
            match result {
                Ok(kind) => tracing::info!(server = %id, transport = %kind, "server connected"),
                Err(e) => {
                    tracing::warn!(server = %id, error = %e, "server failed to connect");
                    errors.push((id, e));
                }
            }
        }
        errors
    }

    /// Attach an already-connected client to a configured server.
    pub async fn attach(
        &self,
        server_id: &str,
        client: Arc<dyn TransportClient>,
    ) -> Result<(), McpError> {
        let previous = {
            let mut servers = self.servers.write().await;
            let slot = servers.get_mut(server_id).ok_or_else(|| McpError::UnknownServer {
                server: server_id.to_string(),
            })?;
            slot.connection.replace(Connection {
                client,
                connected_at: Utc::now(),
            })
        };
        if let Some(old) = previous {
            old.client.disconnect().await;
        }
        Ok(())
    }

    /// Resolve the transport and open it.
    async fn open_connection(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn TransportClient>, McpError> {
        descriptor.validate()?;

        if let Some(kind) = descriptor.transport {
            return self.open_with(descriptor, kind, None).await;
        }

        let has_command = descriptor.launch_command.is_some();

        match self.detector.detect_endpoint(descriptor).await {
            Some(detection) => {
                match self.open_with(descriptor, detection.kind, detection.endpoint.as_deref()).await {
                    Ok(client) => return Ok(client),
                    Err(e) if has_command => {
                        tracing::warn!(
                            server = %descriptor.id,
                            error = %e,
                            "endpoint failed; falling back to launch command"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            None if descriptor.endpoint.is_some() && has_command => {
                tracing::info!(server = %descriptor.id, "endpoint not identified; launching command");
            }
            None if has_command => {
                let detection = self.detector.detect(descriptor).await;
                tracing::debug!(server = %descriptor.id, transport = %detection.kind, "launching command");
            }
            None => {
                return Err(McpError::ProtocolDetectionFailed {
                    server: descriptor.id.clone(),
                    reason: format!(
                        "no known transport answered at {}",
                        descriptor.endpoint.as_deref().unwrap_or("<none>")
                    ),
                })
            }
        }

        self.open_with(descriptor, TransportKind::Pipe, None).await
    }

    async fn open_with(
        &self,
        descriptor: &ServerDescriptor,
        kind: TransportKind,
        endpoint: Option<&str>,
    ) -> Result<Arc<dyn TransportClient>, McpError> {
        let client = build_client(descriptor, kind, endpoint, &self.http)?;
        client.connect().await?;
        Ok(client)
    }

    // ─── Disconnecting ───────────────────────────────────────────────────

    /// Disconnect one server. Returns `false` if it had no connection.
    pub async fn disconnect(&self, server_id: &str) -> bool {
        let connection = {
            let mut servers = self.servers.write().await;
            servers.get_mut(server_id).and_then(|slot| slot.connection.take())
        };
        match connection {
            Some(conn) => {
                conn.client.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Disconnect every server.
    pub async fn disconnect_all(&self) {
        let connections: Vec<Connection> = {
            let mut servers = self.servers.write().await;
            servers
                .values_mut()
                .filter_map(|slot| slot.connection.take())
                .collect()
        };
        futures::future::join_all(connections.iter().map(|c| c.client.disconnect())).await;
    }

    /// Restart a server with exponential backoff (1s, 2s, 4s).
    pub async fn restart(&self, server_id: &str) -> Result<TransportKind, McpError> {
        let restart_count = self
            .servers
            .read()
            .await
            .get(server_id)
            .map(|slot| slot.restart_count)
            .ok_or_else(|| McpError::UnknownServer {
                server: server_id.to_string(),
            })?;

        if restart_count >= MAX_RESTART_ATTEMPTS {
            return Err(McpError::RestartExhausted {
                name: server_id.to_string(),
                attempts: MAX_RESTART_ATTEMPTS,
            });
        }

        self.disconnect(server_id).await;
        let delay = RESTART_BASE_DELAY * 2u32.pow(restart_count);
        tracing::info!(
            server = %server_id,
            attempt = restart_count + 1,
            delay_ms = delay.as_millis() as u64,
            "restarting server"
        );
        sleep(delay).await;

        if let Some(slot) = self.servers.write().await.get_mut(server_id) {
            slot.restart_count = restart_count + 1;
        }
        self.connect(server_id).await
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    /// The live client for a server.
    pub async fn client(&self, server_id: &str) -> Result<Arc<dyn TransportClient>, McpError> {
        let servers = self.servers.read().await;
        let slot = servers.get(server_id).ok_or_else(|| McpError::UnknownServer {
            server: server_id.to_string(),
        })?;
        slot.live_client().ok_or_else(|| McpError::Disconnected {
            server: server_id.to_string(),
            reason: "not connected".into(),
        })
    }

    /// Live clients in server-id order.
    pub async fn connected_clients(&self) -> Vec<(String, Arc<dyn TransportClient>)> {
        self.servers
            .read()
            .await
            .iter()
            .filter_map(|(id, slot)| slot.live_client().map(|c| (id.clone(), c)))
            .collect()
    }

    /// Descriptors of servers with a live connection.
    pub async fn list_connected(&self) -> Vec<ServerDescriptor> {
        self.servers
            .read()
            .await
            .values()
            .filter(|slot| slot.live_client().is_some())
            .map(|slot| slot.descriptor.clone())
            .collect()
    }

    /// Connection state of every configured server.
    pub async fn status(&self) -> Vec<ConnectionInfo> {
        self.servers
            .read()
            .await
            .iter()
            .map(|(id, slot)| match &slot.connection {
                Some(conn) => ConnectionInfo {
                    server_id: id.clone(),
                    transport: Some(conn.client.kind()),
                    connected: conn.client.is_connected(),
                    initialized: conn.client.is_initialized(),
                    pending_requests: conn.client.pending_requests(),
                    connected_at: Some(conn.connected_at),
                },
                None => ConnectionInfo {
                    server_id: id.clone(),
                    transport: None,
                    connected: false,
                    initialized: false,
                    pending_requests: 0,
                    connected_at: None,
                },
            })
            .collect()
    }
}

/// Wire-level failures while connecting all surface as `ConnectionError`;
/// configuration and detection failures keep their own variant.
fn connection_error(server_id: &str, error: McpError) -> McpError {
    match error {
        McpError::ServerInvalid { .. }
        | McpError::ProtocolDetectionFailed { .. }
        | McpError::ConnectionError { .. } => error,
        other => McpError::ConnectionError {
            server: server_id.to_string(),
            reason: other.to_string(),
        },
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
