//! Argument validation and tool call dispatch.
//!
//! Lookup and validation failures are returned as `Err` before anything is
//! sent. Once a call is dispatched, every outcome (including transport
//! failures) comes back as an [`ExecutionResult`] with the elapsed time.
//! Calls are never retried.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use super::catalog::ToolCatalog;
use super::errors::McpError;
use super::lifecycle::ServerRegistry;
use super::types::{error_codes, ExecutionResult, ToolDescriptor};

pub struct ExecutionEngine {
    catalog: Arc<ToolCatalog>,
    registry: Arc<ServerRegistry>,
}

impl ExecutionEngine {
    pub fn new(catalog: Arc<ToolCatalog>, registry: Arc<ServerRegistry>) -> Self {
        Self { catalog, registry }
    }

    /// Resolve and check a call without dispatching it.
    pub fn prepare(&self, tool_name: &str, arguments: &Value) -> Result<ToolDescriptor, McpError> {
        let tool = self.catalog.get(tool_name).ok_or_else(|| McpError::ToolNotFound {
            name: tool_name.to_string(),
        })?;
        tool.schema.validate(tool_name, arguments)?;
        Ok(tool)
    }

    /// Execute a tool by catalog name.
    pub async fn execute(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ExecutionResult, McpError> {
        let tool = self.prepare(tool_name, &arguments)?;
        let arguments = if arguments.is_null() {
            Value::Object(Default::default())
        } else {
            arguments
        };

        let start = Instant::now();
        let outcome = match self.registry.client(&tool.server_id).await {
            Ok(client) => client.call_tool(&tool.original_name, arguments).await,
            Err(e) => Err(e),
        };
        let elapsed = start.elapsed();

        let result = match outcome {
            Ok(value) => match tool_error(&value) {
                Some(message) => ExecutionResult {
                    tool_name: tool.name.clone(),
                    server_id: tool.server_id.clone(),
                    success: false,
                    value: Some(value),
                    error: Some(McpError::ExecutionError {
                        code: error_codes::SERVER_ERROR,
                        message,
                        data: None,
                    }),
                    elapsed,
                },
                None => ExecutionResult {
                    tool_name: tool.name.clone(),
                    server_id: tool.server_id.clone(),
                    success: true,
                    value: Some(value),
                    error: None,
                    elapsed,
                },
            },
            Err(e) => {
                if e.is_connection_lost() {
                    tracing::warn!(tool = %tool.name, server = %tool.server_id, error = %e, "server unavailable");
                }
                ExecutionResult {
                    tool_name: tool.name.clone(),
                    server_id: tool.server_id.clone(),
                    success: false,
                    value: None,
                    error: Some(e),
                    elapsed,
                }
            }
        };

        tracing::info!(
            tool = %result.tool_name,
            server = %result.server_id,
            success = result.success,
            elapsed_ms = elapsed.as_millis() as u64,
            "tool executed"
        );
        Ok(result)
    }
}

/// A successful envelope whose result reports `isError: true`.
fn tool_error(result: &Value) -> Option<String> {
    if result.get("isError").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");
    Some(if text.is_empty() {
        "tool reported an error".to_string()
    } else {
        text
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
