//! JSON-RPC over plain HTTP: one POST per request, the body is the response.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::{Exchange, CONNECT_TIMEOUT};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{
    InboundMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, TransportKind,
};

/// Request-response transport against a single JSON-RPC URL.
pub struct HttpTransport {
    server_id: String,
    url: Url,
    http: reqwest::Client,
    open: AtomicBool,
}

impl HttpTransport {
    pub fn new(server_id: &str, endpoint: &str, http: reqwest::Client) -> Result<Self, McpError> {
        let url = Url::parse(endpoint.trim()).map_err(|e| McpError::ServerInvalid {
            server: server_id.to_string(),
            reason: format!("invalid endpoint '{endpoint}': {e}"),
        })?;
        Ok(Self {
            server_id: server_id.to_string(),
            url,
            http,
            open: AtomicBool::new(false),
        })
    }

    async fn post<T: serde::Serialize + Sync>(
        &self,
        message: &T,
        method: &str,
        timeout: Duration,
    ) -> Result<reqwest::Response, McpError> {
        self.http
            .post(self.url.clone())
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
                } else if e.is_connect() {
                    self.open.store(false, Ordering::Release);
                    McpError::Disconnected {
                        server: self.server_id.clone(),
                        reason: format!("cannot reach {}: {e}", self.url),
                    }
                } else {
                    McpError::TransportError {
                        server: self.server_id.clone(),
                        reason: format!("POST {} failed: {e}", self.url),
                    }
                }
            })
    }
}

#[async_trait]
impl Exchange for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::RequestResponse
    }

    /// Nothing stays open between requests; this only marks the client usable.
    async fn open(&self) -> Result<(), McpError> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(McpError::Disconnected {
                server: self.server_id.clone(),
                reason: "client is closed".into(),
            });
        }

        let response = self.post(&request, &request.method, timeout).await?;
        let status = response.status();
        let body = response.text().await.map_err(|e| McpError::TransportError {
            server: self.server_id.clone(),
            reason: format!("failed to read response body: {e}"),
        })?;

        // Error envelopes often come with 4xx/5xx; the envelope wins.
        match InboundMessage::parse(body.trim()) {
            InboundMessage::Response(resp) if resp.id.as_ref() == Some(&request.id) => Ok(resp),
            InboundMessage::Response(resp) => Err(McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("response id {:?} does not match request {}", resp.id, request.id),
            }),
            _ => Err(McpError::TransportError {
                server: self.server_id.clone(),
                reason: format!("HTTP {status} without a JSON-RPC response"),
            }),
        }
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        let response = self
            .post(&notification, &notification.method, CONNECT_TIMEOUT)
            .await?;
        if response.status().is_server_error() {
            tracing::warn!(
                server = %self.server_id,
                status = %response.status(),
                method = %notification.method,
                "notification rejected"
            );
        }
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
