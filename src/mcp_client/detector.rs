//! Transport detection.
//!
//! Classification runs cheapest-first and stops at the first hit:
//!
//! 1. URL heuristics (`ws://`, `wss://`, `/sse`, `events` path segments)
//! 2. Process identity (known stdio launchers such as `npx` or `uvx`)
//! 3. Active probes with a short timeout: an event-stream handshake, then a
//!    JSON-RPC `initialize` POST
//!
//! Nothing matching yields [`TransportKind::Unknown`]; the registry turns
//! that into `ProtocolDetectionFailed` unless a launch command remains.
//!
//! When connecting, the registry uses [`Detector::detect_endpoint`] so an
//! endpoint is always tried before a recognised launcher.

use std::path::Path;
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::json;
use url::Url;

use super::transport::PROTOCOL_VERSION;
use super::types::{InboundMessage, ServerDescriptor, TransportKind};

/// Per-probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Launchers whose servers speak JSON-RPC on stdio.
const PIPE_LAUNCHERS: &[&str] = &[
    "npx", "uvx", "bunx", "pipx", "uv", "node", "deno", "python", "python3", "docker",
];

/// Server ids known to run as stdio processes.
const PIPE_SERVER_HINTS: &[&str] = &["playwright"];

/// Result of detection: the transport, plus the URL that answered when a
/// probe found the server on a derived address.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub kind: TransportKind,
    pub endpoint: Option<String>,
}

impl Detection {
    fn new(kind: TransportKind, endpoint: Option<&str>) -> Self {
        Self {
            kind,
            endpoint: endpoint.map(String::from),
        }
    }
}

/// Classify an endpoint by its shape alone.
pub fn classify_url(endpoint: &str) -> Option<TransportKind> {
    let endpoint = endpoint.trim();
    let url = if endpoint.contains("://") {
        Url::parse(endpoint).ok()?
    } else {
        Url::parse(&format!("http://{endpoint}")).ok()?
    };

    match url.scheme() {
        "ws" | "wss" => return Some(TransportKind::Socket),
        "http" | "https" => {}
        _ => return None,
    }

    let streams = url
        .path_segments()
        .map(|mut segments| {
            segments.any(|s| s.eq_ignore_ascii_case("sse") || s.to_ascii_lowercase().contains("events"))
        })
        .unwrap_or(false);
    streams.then_some(TransportKind::EventStream)
}

/// Classify a launched server by its id and command.
pub fn classify_process(server_id: &str, command: &str) -> Option<TransportKind> {
    let program = command.split_whitespace().next().unwrap_or_default();
    let stem = Path::new(program)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let id = server_id.to_ascii_lowercase();
    let known = PIPE_LAUNCHERS.contains(&stem.as_str())
        || PIPE_SERVER_HINTS.iter().any(|hint| id.contains(hint));
    known.then_some(TransportKind::Pipe)
}

/// Probes endpoints to find out which transport they speak.
#[derive(Debug, Clone)]
pub struct Detector {
    http: reqwest::Client,
    probe_timeout: Duration,
}

impl Detector {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Run heuristics, then probes, for a server with no configured transport.
    pub async fn detect(&self, descriptor: &ServerDescriptor) -> Detection {
        let endpoint = descriptor.endpoint.as_deref().filter(|e| !e.trim().is_empty());

        if let Some(kind) = endpoint.and_then(classify_url) {
            tracing::debug!(server = %descriptor.id, transport = %kind, "classified by URL");
            return Detection::new(kind, endpoint);
        }

        if let Some(command) = descriptor.launch_command.as_deref() {
            if let Some(kind) = classify_process(&descriptor.id, command) {
                tracing::debug!(server = %descriptor.id, command, "classified by launcher");
                return Detection::new(kind, None);
            }
        }

        if let Some(endpoint) = endpoint {
            if let Some(detection) = self.probe_logged(&descriptor.id, endpoint).await {
                return detection;
            }
        }

        tracing::warn!(server = %descriptor.id, "no transport detected");
        Detection::new(TransportKind::Unknown, None)
    }

    /// Classify the endpoint alone, ignoring any launch command.
    ///
    /// `None` when there is no endpoint or nothing answered on it.
    pub async fn detect_endpoint(&self, descriptor: &ServerDescriptor) -> Option<Detection> {
        let endpoint = descriptor.endpoint.as_deref().filter(|e| !e.trim().is_empty())?;

        if let Some(kind) = classify_url(endpoint) {
            tracing::debug!(server = %descriptor.id, transport = %kind, "classified by URL");
            return Some(Detection::new(kind, Some(endpoint)));
        }
        self.probe_logged(&descriptor.id, endpoint).await
    }

    async fn probe_logged(&self, server_id: &str, endpoint: &str) -> Option<Detection> {
        let detection = self.probe(server_id, endpoint).await?;
        tracing::info!(
            server = %server_id,
            transport = %detection.kind,
            endpoint = ?detection.endpoint,
            "classified by probing"
        );
        Some(detection)
    }

    /// Actively probe `endpoint`. `None` when nothing answered usefully.
    pub async fn probe(&self, server_id: &str, endpoint: &str) -> Option<Detection> {
        let url = Url::parse(endpoint.trim()).ok()?;

        if self.probe_event_stream(&url).await {
            return Some(Detection::new(TransportKind::EventStream, Some(url.as_str())));
        }

        let mut candidates = vec![url.clone()];
        let path = url.path().trim_end_matches('/');
        if !path.ends_with("/jsonrpc") {
            let mut jsonrpc = url.clone();
            jsonrpc.set_path(&format!("{path}/jsonrpc"));
            candidates.push(jsonrpc);
        }
        for candidate in candidates {
            if self.probe_json_rpc(server_id, &candidate).await {
                return Some(Detection::new(
                    TransportKind::RequestResponse,
                    Some(candidate.as_str()),
                ));
            }
        }
        None
    }

    async fn probe_event_stream(&self, url: &Url) -> bool {
        let response = self
            .http
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .timeout(self.probe_timeout)
            .send()
            .await;

        match response {
            Ok(resp) => {
                resp.status().is_success()
                    && resp
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|ct| ct.contains("text/event-stream"))
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "event-stream probe failed");
                false
            }
        }
    }

    async fn probe_json_rpc(&self, server_id: &str, url: &Url) -> bool {
        let body = json!({
            "jsonrpc": "2.0",
            "id": format!("probe-{server_id}"),
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")}
            }
        });

        let response = self
            .http
            .post(url.clone())
            .json(&body)
            .timeout(self.probe_timeout)
            .send()
            .await;
        let Ok(resp) = response else {
            return false;
        };
        match tokio::time::timeout(self.probe_timeout, resp.text()).await {
            Ok(Ok(text)) => matches!(InboundMessage::parse(text.trim()), InboundMessage::Response(_)),
            _ => false,
        }
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
