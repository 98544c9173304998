//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with server child processes:
//! - Spawning the process with its args, env and working directory
//! - Writing one JSON request line to stdin
//! - Reading stdout lines until the response with the matching `id`
//! - Graceful shutdown (close stdin, wait, then kill)
//!
//! The pipe carries no multiplexing, so a single mutex guards the process
//! for the whole write-then-read exchange and callers are served one at a
//! time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::{encode, Exchange};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{
    InboundMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerDescriptor,
    TransportKind,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful shutdown before force-killing.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Stderr lines retained for failure context.
const STDERR_TAIL_LINES: usize = 20;

/// Max chars of stderr appended to an error message.
const STDERR_MAX_CHARS: usize = 2000;

// ─── Transport ───────────────────────────────────────────────────────────────

/// What to run.
#[derive(Debug, Clone)]
struct LaunchSpec {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
}

/// A running child process and its stdio handles.
struct PipeProcess {
    child: Child,
    writer: ChildStdin,
    reader: BufReader<ChildStdout>,
}

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    launch: LaunchSpec,
    process: Mutex<Option<PipeProcess>>,
    alive: AtomicBool,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    shutdown_grace: Duration,
}

impl StdioTransport {
    /// Prepare a transport for the descriptor's launch command.
    pub fn from_descriptor(descriptor: &ServerDescriptor) -> Result<Self, McpError> {
        let command = descriptor
            .launch_command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| McpError::ServerInvalid {
                server: descriptor.id.clone(),
                reason: "pipe transport requires a launch command".into(),
            })?;

        Ok(Self {
            server_name: descriptor.id.clone(),
            launch: LaunchSpec {
                command: command.to_string(),
                args: descriptor.args.clone(),
                env: descriptor.env.clone(),
                cwd: descriptor.cwd.clone(),
            },
            process: Mutex::new(None),
            alive: AtomicBool::new(false),
            stderr_tail: Arc::new(StdMutex::new(VecDeque::new())),
            shutdown_grace: SHUTDOWN_TIMEOUT,
        })
    }

    /// Override how long `close` waits before killing the process.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn spawn(&self) -> Result<PipeProcess, McpError> {
        let mut cmd = Command::new(&self.launch.command);
        cmd.args(&self.launch.args);

        for (key, value) in &self.launch.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.launch.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::ConnectionError {
            server: self.server_name.clone(),
            reason: format!("failed to spawn '{}': {e}", self.launch.command),
        })?;

        let writer = child.stdin.take().ok_or_else(|| McpError::ConnectionError {
            server: self.server_name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::ConnectionError {
            server: self.server_name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        if let Some(stderr) = child.stderr.take() {
            self.drain_stderr(stderr);
        }

        Ok(PipeProcess {
            child,
            writer,
            reader: BufReader::new(stdout),
        })
    }

    /// Forward stderr to the log and keep the last lines for error messages.
    fn drain_stderr(&self, stderr: ChildStderr) {
        let server = self.server_name.clone();
        let tail = self.stderr_tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %server, line = %line, "server stderr");
                let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });
    }

    /// Format a stderr suffix for error messages (empty string if no stderr).
    fn stderr_suffix(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(|p| p.into_inner());
        if tail.is_empty() {
            return String::new();
        }
        let mut joined = tail.iter().cloned().collect::<Vec<_>>().join("\n");
        if joined.len() > STDERR_MAX_CHARS {
            let mut cut = STDERR_MAX_CHARS;
            while !joined.is_char_boundary(cut) {
                cut -= 1;
            }
            joined.truncate(cut);
            joined.push_str("...(truncated)");
        }
        format!(" | stderr: {}", joined.trim())
    }

    fn lost(&self, reason: String) -> McpError {
        self.alive.store(false, Ordering::Release);
        McpError::Disconnected {
            server: self.server_name.clone(),
            reason: format!("{reason}{}", self.stderr_suffix()),
        }
    }

    /// Report an exited process as a disconnection.
    fn check_exited(&self, process: &mut PipeProcess) -> Result<(), McpError> {
        match process.child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => {
                tracing::warn!(server = %self.server_name, %status, "server process exited");
                Err(self.lost(format!("process exited ({status})")))
            }
            Err(e) => Err(self.lost(format!("failed to poll process: {e}"))),
        }
    }

    async fn write_line(&self, process: &mut PipeProcess, mut json: String) -> Result<(), McpError> {
        json.push('\n');
        process
            .writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.lost(format!("failed to write to stdin: {e}")))?;
        process
            .writer
            .flush()
            .await
            .map_err(|e| self.lost(format!("failed to flush stdin: {e}")))
    }

    /// Read lines until the response for `request` arrives.
    async fn read_response(
        &self,
        process: &mut PipeProcess,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, McpError> {
        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = process
                .reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.lost(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.lost("server stdout closed (process may have exited)".into()));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match InboundMessage::parse(trimmed) {
                InboundMessage::Response(resp) if resp.id.as_ref() == Some(&request.id) => {
                    return Ok(resp)
                }
                InboundMessage::Response(resp) => {
                    // Late answer to a request that already timed out.
                    tracing::warn!(
                        server = %self.server_name,
                        id = ?resp.id,
                        "discarding response with no matching request"
                    );
                }
                InboundMessage::Notification { method, .. } => {
                    tracing::debug!(server = %self.server_name, method = %method, "notification on pipe");
                }
                // Server log output on stdout; keep reading.
                _ => {}
            }
        }
    }
}

#[async_trait]
impl Exchange for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pipe
    }

    async fn open(&self) -> Result<(), McpError> {
        let mut slot = self.process.lock().await;
        if slot.is_some() && self.alive.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut process = self.spawn()?;
        if let Ok(Some(status)) = process.child.try_wait() {
            return Err(McpError::ConnectionError {
                server: self.server_name.clone(),
                reason: format!("process exited immediately ({status}){}", self.stderr_suffix()),
            });
        }

        tracing::info!(
            server = %self.server_name,
            command = %self.launch.command,
            pid = process.child.id().unwrap_or_default(),
            "spawned server process"
        );
        *slot = Some(process);
        self.alive.store(true, Ordering::Release);
        Ok(())
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// The process lock is held for the whole exchange, so concurrent
    /// callers queue behind each other.
    async fn request(
        &self,
        request: JsonRpcRequest,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let json = encode(&self.server_name, &request)?;

        let mut slot = self.process.lock().await;
        let process = slot.as_mut().ok_or_else(|| McpError::Disconnected {
            server: self.server_name.clone(),
            reason: "process is not running".into(),
        })?;
        self.check_exited(process)?;

        let exchange = async {
            self.write_line(&mut *process, json).await?;
            self.read_response(&mut *process, &request).await
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(McpError::RequestTimeout {
                server: self.server_name.clone(),
                method: request.method.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        let json = encode(&self.server_name, &notification)?;

        let mut slot = self.process.lock().await;
        let process = slot.as_mut().ok_or_else(|| McpError::Disconnected {
            server: self.server_name.clone(),
            reason: "process is not running".into(),
        })?;
        self.write_line(process, json).await
    }

    /// Close stdin, wait for a graceful exit, then kill.
    async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        let Some(process) = self.process.lock().await.take() else {
            return;
        };

        let PipeProcess {
            mut child,
            writer,
            reader,
        } = process;
        drop(writer);
        drop(reader);

        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.server_name, %status, "server process exited");
            }
            _ => {
                tracing::warn!(
                    server = %self.server_name,
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "server did not exit in time; killing"
                );
                let _ = child.kill().await;
            }
        }
    }

    fn is_open(&self) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        // Only peek when nobody is mid-exchange.
        if let Ok(mut slot) = self.process.try_lock() {
            if let Some(process) = slot.as_mut() {
                if let Ok(Some(_)) = process.child.try_wait() {
                    self.alive.store(false, Ordering::Release);
                    return false;
                }
            }
        }
        true
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mcp_client::transport::{RpcClient, TransportClient};
    use serde_json::json;

    /// A shell one-liner that prints the given lines after each request line.
    fn script_server(id: &str, exchanges: &[&[&str]]) -> ServerDescriptor {
        let mut script = String::new();
        for lines in exchanges {
            script.push_str("read line; ");
            for line in *lines {
                script.push_str(&format!("echo '{line}'; "));
            }
        }
        script.push_str("read line");
        ServerDescriptor::with_command(id, "sh", &["-c", &script])
    }

    #[tokio::test]
    async fn test_request_response_over_pipe() {
        let descriptor = script_server(
            "echo",
            &[
                &[
                    "log noise before the reply",
                    r#"{"jsonrpc":"2.0","method":"notifications/message"}"#,
                    r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"ping"}]}}"#,
                ],
                &[r#"{"jsonrpc":"2.0","id":2,"result":{"content":[]}}"#],
            ],
        );
        let transport = StdioTransport::from_descriptor(&descriptor)
            .unwrap()
            .with_shutdown_grace(Duration::from_millis(200));
        let client = RpcClient::new(&descriptor, transport);
        client.connect().await.unwrap();
        assert!(client.is_connected());

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools[0]["name"], "ping");
        let result = client.call_tool("ping", json!({})).await.unwrap();
        assert!(result["content"].is_array());

        client.disconnect().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_pipe() {
        // Answers each line with its own id and `q` argument after a delay.
        let script = r#"while read line; do
            id=$(echo "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
            q=$(echo "$line" | sed -n 's/.*"q":"\([a-z]*\)".*/\1/p')
            sleep 0.1
            echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"q\":\"$q\"}}"
        done"#;
        let descriptor = ServerDescriptor::with_command("serial", "sh", &["-c", script]);
        let transport = StdioTransport::from_descriptor(&descriptor)
            .unwrap()
            .with_shutdown_grace(Duration::from_millis(200));
        let client = RpcClient::new(&descriptor, transport);
        client.connect().await.unwrap();

        let (first, second) = tokio::join!(
            client.call_tool("lookup", json!({"q": "first"})),
            client.call_tool("lookup", json!({"q": "second"})),
        );
        assert_eq!(first.unwrap()["q"], "first");
        assert_eq!(second.unwrap()["q"], "second");
        assert_eq!(client.pending_requests(), 0);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_exit_surfaces_as_disconnection() {
        let descriptor = ServerDescriptor::with_command(
            "dies",
            "sh",
            &["-c", "echo 'fatal: missing token' >&2; exit 3"],
        );
        let transport = StdioTransport::from_descriptor(&descriptor).unwrap();
        // Spawning succeeds even if the process dies right after.
        let _ = transport.open().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = transport
            .request(JsonRpcRequest::new(1, "tools/list", None), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_connection_lost(), "unexpected error: {err}");
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_connection_error() {
        let descriptor =
            ServerDescriptor::with_command("missing", "/nonexistent/toolmesh-server", &[]);
        let transport = StdioTransport::from_descriptor(&descriptor).unwrap();
        let err = transport.open().await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionError { server, .. } if server == "missing"));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let descriptor = ServerDescriptor::with_command("mute", "sh", &["-c", "cat > /dev/null"]);
        let transport = StdioTransport::from_descriptor(&descriptor)
            .unwrap()
            .with_shutdown_grace(Duration::from_millis(200));
        transport.open().await.unwrap();

        let err = transport
            .request(JsonRpcRequest::new(1, "tools/call", None), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::RequestTimeout { timeout_ms: 100, .. }));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_close_kills_process_that_ignores_eof() {
        let descriptor =
            ServerDescriptor::with_command("stubborn", "sh", &["-c", "trap '' TERM; sleep 30"]);
        let transport = StdioTransport::from_descriptor(&descriptor)
            .unwrap()
            .with_shutdown_grace(Duration::from_millis(100));
        transport.open().await.unwrap();

        let started = std::time::Instant::now();
        transport.close().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_pipe_requires_command() {
        let descriptor = ServerDescriptor::with_endpoint("net", "http://localhost:1");
        let err = StdioTransport::from_descriptor(&descriptor).err().unwrap();
        assert!(matches!(err, McpError::ServerInvalid { .. }));
    }
}
