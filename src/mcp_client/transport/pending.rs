//! Outstanding request table for multiplexed transports.
//!
//! Socket and event-stream clients send a request, then a background read
//! loop delivers the response whenever it arrives. Each request parks a
//! oneshot sender here under its id; the read loop resolves it, the waiter
//! purges it on timeout, and closing the connection fails every entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{JsonRpcResponse, RequestId};

type Reply = Result<JsonRpcResponse, McpError>;

/// A request that has been sent and not yet answered.
#[derive(Debug)]
pub struct PendingRequest {
    pub method: String,
    pub issued_at: Instant,
    pub timeout: Duration,
    sender: oneshot::Sender<Reply>,
}

/// Id → waiter map shared between callers and a connection's read loop.
#[derive(Debug)]
pub struct PendingTable {
    server_id: String,
    entries: Mutex<HashMap<RequestId, PendingRequest>>,
    closed: AtomicBool,
}

impl PendingTable {
    pub fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Park a waiter for `id`. Fails once the table has been closed.
    pub fn register(
        &self,
        id: RequestId,
        method: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Reply>, McpError> {
        // `closed` is read under the map lock so a concurrent `cancel_all`
        // either sees this entry or this call sees the table closed.
        let mut entries = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(McpError::Disconnected {
                server: self.server_id.clone(),
                reason: "connection is closed".into(),
            });
        }

        let (sender, receiver) = oneshot::channel();
        let entry = PendingRequest {
            method: method.to_string(),
            issued_at: Instant::now(),
            timeout,
            sender,
        };
        entries.insert(id, entry);
        Ok(receiver)
    }

    /// Deliver a response to its waiter.
    ///
    /// Returns `false` when no request with that id is outstanding; the
    /// caller logs and discards such responses.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id.clone() else {
            return false;
        };
        let Some(entry) = self.lock().remove(&id) else {
            return false;
        };

        tracing::debug!(
            server = %self.server_id,
            id = %id,
            method = %entry.method,
            elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
            "response correlated"
        );
        // The waiter may already have given up; nothing to do then.
        let _ = entry.sender.send(Ok(response));
        true
    }

    /// Drop the entry for `id`. Safe to call any number of times.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Fail every outstanding request and refuse new ones.
    pub fn cancel_all(&self, reason: &str) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            tracing::info!(
                server = %self.server_id,
                cancelled = drained.len(),
                reason,
                "cancelling pending requests"
            );
        }
        for (_, entry) in drained {
            let _ = entry.sender.send(Err(McpError::Disconnected {
                server: self.server_id.clone(),
                reason: reason.to_string(),
            }));
        }
    }

    /// Accept requests again after a reconnect.
    pub fn reopen(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the response to `id`, purging the entry on timeout.
    pub async fn wait(
        &self,
        id: &RequestId,
        receiver: oneshot::Receiver<Reply>,
        method: &str,
        timeout: Duration,
    ) -> Reply {
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(McpError::Disconnected {
                server: self.server_id.clone(),
                reason: "response channel dropped".into(),
            }),
            Err(_) => {
                self.remove(id);
                tracing::warn!(
                    server = %self.server_id,
                    id = %id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(McpError::RequestTimeout {
                    server: self.server_id.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: u64) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(RequestId::Number(id)),
            result: Some(serde_json::json!({"ok": true})),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_resolve_delivers_to_waiter() {
        let table = PendingTable::new("s");
        let id = RequestId::Number(1);
        let rx = table.register(id.clone(), "tools/list", Duration::from_secs(1)).unwrap();
        assert_eq!(table.len(), 1);

        assert!(table.resolve(response(1)));
        let reply = table.wait(&id, rx, "tools/list", Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.result.unwrap()["ok"], true);
        assert!(table.is_empty());
    }

    #[test]
    fn test_unknown_id_is_not_resolved() {
        let table = PendingTable::new("s");
        assert!(!table.resolve(response(42)));

        let mut no_id = response(1);
        no_id.id = None;
        assert!(!table.resolve(no_id));
    }

    #[tokio::test]
    async fn test_timeout_purges_entry() {
        let table = PendingTable::new("s");
        let id = RequestId::Number(7);
        let rx = table.register(id.clone(), "tools/call", Duration::from_millis(20)).unwrap();

        let err = table
            .wait(&id, rx, "tools/call", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::RequestTimeout { timeout_ms: 20, .. }));
        assert!(table.is_empty());

        // Cleanup is idempotent and a late response is simply unmatched.
        assert!(!table.remove(&id));
        assert!(!table.resolve(response(7)));
    }

    #[tokio::test]
    async fn test_cancel_all_fails_waiters_and_closes() {
        let table = PendingTable::new("s");
        let rx1 = table.register(RequestId::Number(1), "a", Duration::from_secs(5)).unwrap();
        let rx2 = table.register(RequestId::Text("x".into()), "b", Duration::from_secs(5)).unwrap();

        table.cancel_all("disconnected by client");
        assert!(table.is_empty());
        assert!(matches!(rx1.await.unwrap(), Err(McpError::Disconnected { .. })));
        assert!(matches!(rx2.await.unwrap(), Err(McpError::Disconnected { .. })));

        let err = table
            .register(RequestId::Number(3), "c", Duration::from_secs(1))
            .unwrap_err();
        assert!(err.is_connection_lost());

        table.reopen();
        assert!(table.register(RequestId::Number(3), "c", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_register_racing_cancel_never_strands_a_waiter() {
        for _ in 0..200 {
            let table = std::sync::Arc::new(PendingTable::new("s"));
            let canceller = {
                let table = table.clone();
                std::thread::spawn(move || table.cancel_all("closing"))
            };
            let registered: Vec<_> = (0..8u64)
                .filter_map(|n| {
                    table
                        .register(RequestId::Number(n), "m", Duration::from_secs(30))
                        .ok()
                })
                .collect();
            canceller.join().unwrap();

            // Every waiter that got in was failed by the cancel.
            assert!(table.is_empty());
            for mut rx in registered {
                assert!(matches!(rx.try_recv(), Ok(Err(McpError::Disconnected { .. }))));
            }
        }
    }
}
