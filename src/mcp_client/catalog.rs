//! Tool catalog aggregated across connected servers.
//!
//! Discovery builds a complete new map and swaps it in under the write lock,
//! so readers see either the previous catalog or the new one, never a
//! half-built map. Name collisions across servers are resolved by prefixing
//! the later server's id (`serverB_search`).

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use super::errors::McpError;
use super::lifecycle::ServerRegistry;
use super::transport::TransportClient;
use super::types::ToolDescriptor;

/// Immutable snapshot of the catalog, keyed by catalog name.
pub type ToolMap = BTreeMap<String, ToolDescriptor>;

/// Outcome of a discovery pass.
#[derive(Debug, Clone)]
pub struct DiscoveryReport {
    pub tools: Arc<ToolMap>,
    /// Servers that contributed nothing, with the cause.
    pub failures: Vec<(String, McpError)>,
}

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ToolCatalog {
    tools: RwLock<Arc<ToolMap>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot. Cheap; later discoveries do not affect it.
    pub fn snapshot(&self) -> Arc<ToolMap> {
        self.tools.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn swap(&self, next: ToolMap) -> Arc<ToolMap> {
        let next = Arc::new(next);
        *self.tools.write().unwrap_or_else(|p| p.into_inner()) = next.clone();
        next
    }

    // ─── Discovery ───────────────────────────────────────────────────────

    /// Initialize and list every connected server, then replace the catalog.
    ///
    /// A failing server contributes zero tools; the others are unaffected.
    pub async fn discover_all(&self, registry: &ServerRegistry) -> DiscoveryReport {
        let clients = registry.connected_clients().await;
        let listings = futures::future::join_all(
            clients
                .iter()
                .map(|(id, client)| async move { (id.clone(), list_server(client.as_ref()).await) }),
        )
        .await;

        let mut failures = Vec::new();
        let mut per_server = Vec::new();
        for (server_id, listing) in listings {
            match listing {
                Ok(records) => per_server.push((server_id, records)),
                Err(e) => {
                    tracing::warn!(server = %server_id, error = %e, "tool discovery failed");
                    failures.push((server_id, e));
                }
            }
        }

        let mut next = ToolMap::new();
        for (server_id, records) in per_server {
            merge_server_tools(&mut next, &server_id, &records);
        }

        tracing::info!(
            tools = next.len(),
            servers = clients.len(),
            failed = failures.len(),
            "tool discovery complete"
        );
        DiscoveryReport {
            tools: self.swap(next),
            failures,
        }
    }

    /// Drop every tool owned by `server_id`.
    ///
    /// The filtered map is built under the write lock so a discovery that
    /// lands meanwhile is never overwritten with stale contents.
    pub fn remove_server(&self, server_id: &str) -> usize {
        let mut tools = self.tools.write().unwrap_or_else(|p| p.into_inner());
        let next: ToolMap = tools
            .iter()
            .filter(|(_, tool)| tool.server_id != server_id)
            .map(|(name, tool)| (name.clone(), tool.clone()))
            .collect();
        let removed = tools.len() - next.len();
        if removed > 0 {
            *tools = Arc::new(next);
        }
        removed
    }

    pub fn clear(&self) {
        self.swap(ToolMap::new());
    }

    // ─── Lookup ──────────────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<ToolDescriptor> {
        self.snapshot().get(name).cloned()
    }

    /// All tools in name order.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.snapshot().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Count tools belonging to a specific server.
    pub fn tools_for_server(&self, server_id: &str) -> usize {
        self.snapshot()
            .values()
            .filter(|tool| tool.server_id == server_id)
            .count()
    }

    /// Case-insensitive substring search over name and description.
    ///
    /// A tool matches when any term matches; tools matching more terms come
    /// first, ties in name order. Blank terms are ignored.
    pub fn find_by_keyword<S: AsRef<str>>(&self, terms: &[S]) -> Vec<ToolDescriptor> {
        let terms: Vec<String> = terms
            .iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let snapshot = self.snapshot();
        let mut hits: Vec<(usize, &ToolDescriptor)> = snapshot
            .values()
            .filter_map(|tool| {
                let haystack = format!("{} {}", tool.name, tool.description).to_lowercase();
                let score = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
                (score > 0).then_some((score, tool))
            })
            .collect();
        hits.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));
        hits.into_iter().map(|(_, tool)| tool.clone()).collect()
    }

    /// Serialize all tools into OpenAI function-calling format.
    pub fn to_openai_tools(&self) -> Vec<Value> {
        self.snapshot()
            .values()
            .map(ToolDescriptor::to_openai_tool)
            .collect()
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn list_server(client: &dyn TransportClient) -> Result<Vec<Value>, McpError> {
    client.initialize_session().await?;
    client.list_tools().await
}

/// Parse one server's records into `tools`, renaming on collision.
fn merge_server_tools(tools: &mut ToolMap, server_id: &str, records: &[Value]) {
    for record in records {
        let Some(mut tool) = ToolDescriptor::from_record(server_id, record) else {
            tracing::warn!(server = %server_id, record = %record, "dropping tool record without a name");
            continue;
        };

        if tools.contains_key(&tool.name) {
            let renamed = unique_name(tools, &format!("{server_id}_{}", tool.original_name));
            tracing::info!(
                server = %server_id,
                tool = %tool.original_name,
                renamed = %renamed,
                "tool name collision"
            );
            tool.name = renamed;
        }
        tools.insert(tool.name.clone(), tool);
    }
}

fn unique_name(tools: &ToolMap, base: &str) -> String {
    if !tools.contains_key(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !tools.contains_key(candidate))
        .unwrap_or_else(|| base.to_string())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
