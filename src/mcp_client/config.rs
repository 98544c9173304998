//! Server configuration loading.
//!
//! A config is a map of server id → entry, either bare or wrapped under
//! `mcpServers` / `servers`, in JSON or YAML:
//!
//! ```json
//! {
//!   "weather": { "endpoint": "http://localhost:8000/sse" },
//!   "files":   { "launchCommand": "npx", "args": ["-y", "server-fs", "${HOME}"] }
//! }
//! ```
//!
//! `${VAR}` and `${VAR:-default}` are interpolated before parsing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::errors::McpError;
use super::types::{
    MethodNames, ServerDescriptor, ServerFamily, TransportKind, DEFAULT_REQUEST_TIMEOUT,
};

/// Where configuration text comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    Json(String),
    Yaml(String),
    /// `.yaml` / `.yml` files are read as YAML, everything else as JSON.
    File(PathBuf),
}

/// Per-method overrides on top of a server family's defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MethodOverrides {
    initialize: Option<String>,
    initialized: Option<String>,
    list_tools: Option<String>,
    call_tool: Option<String>,
}

/// One server entry as written in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerEntry {
    #[serde(default, alias = "url")]
    endpoint: Option<String>,
    #[serde(default, rename = "launchCommand", alias = "launch_command", alias = "command")]
    launch_command: Option<String>,
    #[serde(default, alias = "server_args")]
    args: Vec<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, alias = "environment")]
    env: HashMap<String, String>,
    #[serde(default, alias = "directory")]
    cwd: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    transport: Option<TransportKind>,
    #[serde(default)]
    family: ServerFamily,
    #[serde(default)]
    methods: MethodOverrides,
    #[serde(default, rename = "timeoutMs", alias = "timeout_ms")]
    timeout_ms: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

impl ServerEntry {
    fn into_descriptor(self, id: &str) -> ServerDescriptor {
        let mut methods = MethodNames::for_family(self.family);
        let overrides = self.methods;
        if let Some(m) = overrides.initialize {
            methods.initialize = m;
        }
        if let Some(m) = overrides.initialized {
            methods.initialized = (!m.is_empty()).then_some(m);
        }
        if let Some(m) = overrides.list_tools {
            methods.list_tools = m;
        }
        if let Some(m) = overrides.call_tool {
            methods.call_tool = m;
        }

        let non_empty = |s: Option<String>| s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        ServerDescriptor {
            id: id.to_string(),
            endpoint: non_empty(self.endpoint),
            launch_command: non_empty(self.launch_command),
            args: self.args,
            description: self.description,
            env: self.env,
            cwd: self.cwd.map(|d| expand_tilde(&d)),
            transport: self.transport.filter(|t| *t != TransportKind::Unknown),
            methods,
            request_timeout: self
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load and validate server descriptors, sorted by id.
///
/// Disabled entries are skipped. Any malformed entry, invalid id, or entry
/// with neither endpoint nor launch command fails the whole load.
pub fn load_config(source: &ConfigSource) -> Result<Vec<ServerDescriptor>, McpError> {
    let (text, yaml) = match source {
        ConfigSource::Json(text) => (text.clone(), false),
        ConfigSource::Yaml(text) => (text.clone(), true),
        ConfigSource::File(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
                reason: format!("failed to read {}: {e}", path.display()),
            })?;
            (text, is_yaml_path(path))
        }
    };

    let interpolated = interpolate_env_vars(&text);
    if interpolated.trim().is_empty() {
        return Err(McpError::ConfigError {
            reason: "config is empty".into(),
        });
    }

    let root: Value = if yaml {
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse YAML config: {e}"),
        })?
    } else {
        serde_json::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse JSON config: {e}"),
        })?
    };

    parse_servers(root)
}

/// Non-fatal file load: a missing, empty or malformed file yields no servers.
pub fn load_config_file(path: &Path) -> Vec<ServerDescriptor> {
    match load_config(&ConfigSource::File(path.to_path_buf())) {
        Ok(servers) => {
            tracing::info!(
                path = %path.display(),
                server_count = servers.len(),
                servers = ?servers.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
                "loaded server config"
            );
            servers
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "no servers loaded");
            Vec::new()
        }
    }
}

fn is_yaml_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
}

fn parse_servers(root: Value) -> Result<Vec<ServerDescriptor>, McpError> {
    let map = match root {
        Value::Object(map) => map,
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(McpError::ConfigError {
                reason: format!("config root must be a mapping, got {}", kind_of(&other)),
            })
        }
    };

    // Unwrap `{"mcpServers": {...}}` / `{"servers": {...}}`.
    let wrapped = ["mcpServers", "servers"]
        .iter()
        .find_map(|key| match map.get(*key) {
            Some(Value::Object(inner)) if map.len() == 1 => Some(inner.clone()),
            _ => None,
        });
    let map = wrapped.unwrap_or(map);

    let mut servers = Vec::with_capacity(map.len());
    for (id, raw) in map {
        validate_server_id(&id)?;
        let entry: ServerEntry = serde_json::from_value(raw).map_err(|e| McpError::ConfigError {
            reason: format!("server '{id}': {e}"),
        })?;

        if !entry.enabled {
            tracing::info!(server = %id, "server disabled in config; skipping");
            continue;
        }

        let descriptor = entry.into_descriptor(&id);
        descriptor.validate().map_err(|e| McpError::ConfigError {
            reason: e.to_string(),
        })?;
        servers.push(descriptor);
    }

    servers.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(servers)
}

/// Ids are used in renamed tool names, so keep them to `[A-Za-z0-9_-]`.
fn validate_server_id(id: &str) -> Result<(), McpError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(McpError::ConfigError {
            reason: format!("invalid server id '{id}': use letters, digits, '_' or '-'"),
        })
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load_json(text: &str) -> Result<Vec<ServerDescriptor>, McpError> {
        load_config(&ConfigSource::Json(text.to_string()))
    }

    #[test]
    fn test_bare_map_with_aliases() {
        let servers = load_json(
            r#"{
                "weather": {"url": "http://localhost:8000/sse", "description": "Weather"},
                "files": {
                    "command": "npx",
                    "server_args": ["-y", "server-fs"],
                    "environment": {"ROOT": "/tmp"},
                    "directory": "/srv"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(servers.len(), 2);
        // Sorted by id.
        assert_eq!(servers[0].id, "files");
        assert_eq!(servers[0].launch_command.as_deref(), Some("npx"));
        assert_eq!(servers[0].args, vec!["-y", "server-fs"]);
        assert_eq!(servers[0].env["ROOT"], "/tmp");
        assert_eq!(servers[0].cwd.as_deref(), Some("/srv"));
        assert_eq!(servers[1].endpoint.as_deref(), Some("http://localhost:8000/sse"));
        assert_eq!(servers[1].request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_wrapped_map_and_overrides() {
        let servers = load_json(
            r#"{"mcpServers": {
                "old": {
                    "endpoint": "http://h/rpc",
                    "family": "legacy",
                    "transport": "http",
                    "timeoutMs": 500,
                    "methods": {"callTool": "runTool", "initialized": ""}
                }
            }}"#,
        )
        .unwrap();

        let old = &servers[0];
        assert_eq!(old.methods.list_tools, "getTools");
        assert_eq!(old.methods.call_tool, "runTool");
        assert_eq!(old.methods.initialized, None);
        assert_eq!(old.transport, Some(TransportKind::RequestResponse));
        assert_eq!(old.request_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_disabled_entries_skipped() {
        let servers = load_json(
            r#"{"a": {"endpoint": "ws://x"}, "b": {"launchCommand": "srv", "enabled": false}}"#,
        )
        .unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "a");
    }

    #[test]
    fn test_entry_without_endpoint_or_command_fails() {
        let err = load_json(r#"{"b": {"description": "nothing to run"}}"#).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { ref reason } if reason.contains("'b'")));
    }

    #[test]
    fn test_malformed_entries_fail() {
        assert!(load_json(r#"{"a": {"endpoint": 5}}"#).is_err());
        assert!(load_json(r#"{"a": {"endpont": "ws://x"}}"#).is_err());
        assert!(load_json(r#"{"bad id!": {"endpoint": "ws://x"}}"#).is_err());
        assert!(load_json(r#"["a"]"#).is_err());
        assert!(load_json("{not json").is_err());
        assert!(load_json("   ").is_err());
    }

    #[test]
    fn test_yaml_file_with_env_interpolation() {
        std::env::set_var("__TOOLMESH_TEST_PORT__", "9123");
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "servers:\n  api:\n    endpoint: http://localhost:${{__TOOLMESH_TEST_PORT__}}/sse\n    \
             args: [\"${{__TOOLMESH_UNSET__:-fallback}}\"]\n    launchCommand: srv"
        )
        .unwrap();

        let servers = load_config(&ConfigSource::File(file.path().to_path_buf())).unwrap();
        assert_eq!(servers[0].endpoint.as_deref(), Some("http://localhost:9123/sse"));
        assert_eq!(servers[0].args, vec!["fallback"]);
        std::env::remove_var("__TOOLMESH_TEST_PORT__");
    }

    #[test]
    fn test_file_load_is_non_fatal() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{{ broken").unwrap();
        assert!(load_config_file(file.path()).is_empty());

        let empty = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        assert!(load_config_file(empty.path()).is_empty());

        assert!(load_config_file(Path::new("/nonexistent/toolmesh.json")).is_empty());
    }

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TOOLMESH_NONEXISTENT_VAR__");
        let result = interpolate_env_vars("${__TOOLMESH_NONEXISTENT_VAR__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/servers");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/servers"));
    }
}
