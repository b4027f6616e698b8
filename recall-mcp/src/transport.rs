//! MCP Transport Layer
//!
//! `StdioTransport` speaks newline-delimited JSON-RPC to a child process.
//! One request is in flight at a time: the request line and its reply are
//! exchanged under a single lock so replies cannot be handed to the wrong
//! caller.

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::error::{McpError, Result};
use crate::types::{JsonRpcRequest, JsonRpcResponse};

/// Default time a peer gets to exit after its stdin is closed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ══════════════════════════════════════════════════════════════════════════════
// Transport Trait
// ══════════════════════════════════════════════════════════════════════════════

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a JSON-RPC request and wait for response
    async fn send(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn notify(&self, request: &JsonRpcRequest) -> Result<()>;

    /// Check if the transport is connected/healthy
    async fn is_alive(&self) -> bool;

    /// Close the transport. Calling it more than once is a no-op.
    async fn close(&self) -> Result<()>;
}

// ══════════════════════════════════════════════════════════════════════════════
// Stdio Transport
// ══════════════════════════════════════════════════════════════════════════════

struct StdioPipes {
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

/// Transport for local MCP servers via stdio
pub struct StdioTransport {
    program: String,
    pid: Option<u32>,
    process: Mutex<Child>,
    io: Mutex<StdioPipes>,
    closed: AtomicBool,
    shutdown_grace: Duration,
}

impl StdioTransport {
    /// Spawn a new MCP server process.
    ///
    /// `command[0]` is the program, the rest are its arguments. Stderr is
    /// inherited so the peer's diagnostics land in the service log.
    pub fn spawn(command: &[String], environment: &HashMap<String, String>) -> Result<Self> {
        let (program, args) = command.split_first().ok_or(McpError::EmptyCommand)?;
        if program.trim().is_empty() {
            return Err(McpError::EmptyCommand);
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut process = cmd.spawn().map_err(|source| McpError::Spawn {
            program: program.clone(),
            source,
        })?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| McpError::Protocol("failed to capture MCP server stdin".into()))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| McpError::Protocol("failed to capture MCP server stdout".into()))?;

        let pid = process.id();
        tracing::info!(program = %program, pid = ?pid, "MCP server process started");

        Ok(Self {
            program: program.clone(),
            pid,
            process: Mutex::new(process),
            io: Mutex::new(StdioPipes {
                stdin: Some(stdin),
                stdout: BufReader::new(stdout),
            }),
            closed: AtomicBool::new(false),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    /// Override how long `close` waits before killing the process.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    async fn write_line(pipes: &mut StdioPipes, request: &JsonRpcRequest) -> Result<()> {
        let stdin = pipes.stdin.as_mut().ok_or(McpError::Closed)?;
        let mut json = serde_json::to_string(request)
            .map_err(|e| McpError::Protocol(format!("failed to encode request: {e}")))?;
        json.push('\n');

        stdin
            .write_all(json.as_bytes())
            .await
            .map_err(McpError::from_pipe)?;
        stdin.flush().await.map_err(McpError::from_pipe)?;
        Ok(())
    }

    /// Read the next reply, skipping blank lines, log noise and
    /// server-initiated requests or notifications.
    async fn read_reply(pipes: &mut StdioPipes) -> Result<JsonRpcResponse> {
        let mut line = String::new();

        loop {
            line.clear();
            let bytes = pipes
                .stdout
                .read_line(&mut line)
                .await
                .map_err(McpError::from_pipe)?;

            if bytes == 0 {
                return Err(McpError::Closed);
            }

            let trimmed = line.trim();
            if trimmed.is_empty() || !trimmed.starts_with('{') {
                continue;
            }

            let value: serde_json::Value = serde_json::from_str(trimmed)
                .map_err(|e| McpError::Protocol(format!("malformed reply: {e}")))?;

            if value.get("method").is_some() {
                tracing::debug!(
                    method = %value["method"],
                    "Ignoring server-initiated MCP message"
                );
                continue;
            }

            return serde_json::from_value(value)
                .map_err(|e| McpError::Protocol(format!("malformed reply: {e}")));
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(McpError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        self.ensure_open()?;
        let mut pipes = self.io.lock().await;
        self.ensure_open()?;

        Self::write_line(&mut pipes, request).await?;
        let response = Self::read_reply(&mut pipes).await?;

        if response.id != request.id {
            return Err(McpError::Protocol(format!(
                "reply id {:?} does not match request id {:?}",
                response.id, request.id
            )));
        }

        Ok(response)
    }

    async fn notify(&self, request: &JsonRpcRequest) -> Result<()> {
        self.ensure_open()?;
        let mut pipes = self.io.lock().await;
        Self::write_line(&mut pipes, request).await
    }

    async fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut process = self.process.lock().await;
        matches!(process.try_wait(), Ok(None))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Closing stdin asks the peer to exit. If a request still holds the
        // pipes we skip straight to the grace wait.
        if let Ok(mut pipes) = self.io.try_lock() {
            pipes.stdin.take();
        }

        let mut process = self.process.lock().await;
        match tokio::time::timeout(self.shutdown_grace, process.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(
                    program = %self.program,
                    pid = ?self.pid,
                    %status,
                    "MCP server process exited"
                );
            }
            Ok(Err(e)) => {
                tracing::warn!(program = %self.program, error = %e, "Failed to wait for MCP server");
            }
            Err(_) => {
                tracing::warn!(
                    program = %self.program,
                    pid = ?self.pid,
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    "MCP server did not exit in time, killing"
                );
                if let Err(e) = process.kill().await {
                    tracing::warn!(program = %self.program, error = %e, "Failed to kill MCP server process");
                }
            }
        }

        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::types::JsonRpcId;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn spawn_rejects_empty_command() {
        let result = StdioTransport::spawn(&[], &HashMap::new());
        assert!(matches!(result, Err(McpError::EmptyCommand)));
    }

    #[test]
    fn spawn_reports_missing_program() {
        let result = StdioTransport::spawn(
            &cmd(&["/definitely/not/a/real/mcp-server"]),
            &HashMap::new(),
        );
        assert!(matches!(result, Err(McpError::Spawn { .. })));
    }

    #[tokio::test]
    async fn echo_peer_returns_matching_reply() {
        // `cat` echoes each request line; a request with an id and no
        // method would be skipped, so send a response-shaped line instead.
        let transport = StdioTransport::spawn(&cmd(&["cat"]), &HashMap::new()).unwrap();
        let mut pipes = transport.io.lock().await;
        let stdin = pipes.stdin.as_mut().unwrap();
        stdin
            .write_all(b"not json\n\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n{\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{}}\n")
            .await
            .unwrap();
        stdin.flush().await.unwrap();

        let reply = StdioTransport::read_reply(&mut pipes).await.unwrap();
        assert_eq!(reply.id, Some(JsonRpcId::Number(3)));
        drop(pipes);

        transport.close().await.unwrap();
        assert!(!transport.is_alive().await);
    }

    #[tokio::test]
    async fn echoed_request_is_not_taken_as_reply() {
        // A request echoed back carries "method" and is skipped; EOF follows
        // once stdin closes.
        let transport = StdioTransport::spawn(&cmd(&["head", "-n", "1"]), &HashMap::new()).unwrap();
        let request = JsonRpcRequest::new(1i64, "tools/list");
        let err = transport.send(&request).await.unwrap_err();
        assert!(matches!(err, McpError::Closed));
    }

    #[tokio::test]
    async fn reply_with_wrong_id_is_protocol_error() {
        let script = r#"read line; echo '{"jsonrpc":"2.0","id":99,"result":{}}'; cat > /dev/null"#;
        let transport = StdioTransport::spawn(&cmd(&["sh", "-c", script]), &HashMap::new())
            .unwrap()
            .with_shutdown_grace(Duration::from_millis(100));

        let err = transport
            .send(&JsonRpcRequest::new(1i64, "tools/list"))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Protocol(ref msg) if msg.contains("99")));
        assert!(err.is_protocol());

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn exited_peer_reports_closed() {
        let transport = StdioTransport::spawn(&cmd(&["true"]), &HashMap::new()).unwrap();
        let request = JsonRpcRequest::new(1i64, "initialize");
        let err = transport.send(&request).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn close_kills_peer_that_ignores_stdin() {
        let transport = StdioTransport::spawn(&cmd(&["sleep", "30"]), &HashMap::new())
            .unwrap()
            .with_shutdown_grace(Duration::from_millis(100));
        assert!(transport.is_alive().await);

        let started = std::time::Instant::now();
        transport.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!transport.is_alive().await);

        // idempotent
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let transport = StdioTransport::spawn(&cmd(&["cat"]), &HashMap::new()).unwrap();
        transport.close().await.unwrap();
        let err = transport
            .send(&JsonRpcRequest::new(1i64, "ping"))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Closed));
    }
}
