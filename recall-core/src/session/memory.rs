//! A live MCP session with one user's memory peer.

use recall_mcp::{CallToolResult, McpClient};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::config_file::SessionConfigFile;
use crate::error::SessionError;
use crate::identity::UserId;

/// One remembered exchange returned by retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnippet {
    pub user_input: String,
    pub agent_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Decoded reply of the retrieve tool. Fields other than
/// `short_term_memory` are kept but not interpreted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    #[serde(default)]
    pub short_term_memory: Vec<MemorySnippet>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Names of the tools a memory peer must expose.
#[derive(Debug, Clone)]
pub struct MemoryTools {
    pub retrieve: String,
    pub store: String,
}

impl Default for MemoryTools {
    fn default() -> Self {
        Self {
            retrieve: "retrieve_memory".into(),
            store: "add_memory".into(),
        }
    }
}

/// A user's connection to their memory peer.
pub struct MemorySession {
    user: UserId,
    client: McpClient,
    tools: MemoryTools,
    config: Option<SessionConfigFile>,
    healthy: AtomicBool,
    shut_down: AtomicBool,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last call.
    last_activity_ms: AtomicU64,
}

impl MemorySession {
    pub fn new(
        user: UserId,
        client: McpClient,
        tools: MemoryTools,
        config: Option<SessionConfigFile>,
    ) -> Self {
        Self {
            user,
            client,
            tools,
            config,
            healthy: AtomicBool::new(true),
            shut_down: AtomicBool::new(false),
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn config_path(&self) -> Option<&std::path::Path> {
        self.config.as_ref().map(SessionConfigFile::path)
    }

    /// False once a call failed at the channel level or the session was shut down.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire) && !self.shut_down.load(Ordering::Acquire)
    }

    /// Healthy and the peer process is still running.
    pub async fn is_alive(&self) -> bool {
        self.is_healthy() && self.client.is_alive().await
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Release);
    }

    /// Time since the last call (or since creation if there was none).
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        self.created_at.elapsed().saturating_sub(last)
    }

    fn touch(&self) {
        let now = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Release);
    }

    async fn call(
        &self,
        tool: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<CallToolResult, SessionError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(SessionError::Released);
        }
        self.touch();

        let result = self.client.call_tool(tool, arguments).await.map_err(|e| {
            let err = SessionError::from_mcp(tool, e);
            if err.is_peer_failure() {
                self.mark_unhealthy();
            }
            err
        })?;

        if result.is_error {
            let message = result
                .first_text()
                .unwrap_or("tool reported an error")
                .to_string();
            return Err(SessionError::Tool {
                tool: tool.to_string(),
                message,
            });
        }

        Ok(result)
    }

    /// Fetch memories relevant to `query`.
    pub async fn retrieve_memory(&self, query: &str) -> Result<RetrievalResult, SessionError> {
        let mut arguments = serde_json::Map::new();
        arguments.insert("query".into(), serde_json::Value::String(query.to_string()));

        let result = self.call(&self.tools.retrieve, arguments).await?;
        let decoded = decode_retrieval(&self.tools.retrieve, &result);
        if matches!(decoded, Err(SessionError::Protocol(_))) {
            self.mark_unhealthy();
        }
        decoded
    }

    /// Persist one exchange.
    pub async fn store_memory(
        &self,
        user_input: &str,
        agent_response: &str,
    ) -> Result<(), SessionError> {
        let mut arguments = serde_json::Map::new();
        arguments.insert(
            "user_input".into(),
            serde_json::Value::String(user_input.to_string()),
        );
        arguments.insert(
            "agent_response".into(),
            serde_json::Value::String(agent_response.to_string()),
        );

        let result = self.call(&self.tools.store, arguments).await?;
        if let Some(message) = result.first_text().and_then(reported_failure) {
            return Err(SessionError::Tool {
                tool: self.tools.store.clone(),
                message,
            });
        }
        Ok(())
    }

    /// Cancel in-flight calls, stop the peer and remove its config file.
    /// Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.client.close().await {
            tracing::warn!(user_id = %self.user, error = %e, "Error closing memory peer");
        }
        if let Some(config) = &self.config {
            config.remove().await;
        }

        tracing::info!(
            user_id = %self.user,
            lifetime_ms = self.created_at.elapsed().as_millis() as u64,
            "Memory session closed"
        );
    }
}

/// `{"status": "error", "message": ...}` replies carried as ordinary text.
fn reported_failure(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("status").and_then(|s| s.as_str()) != Some("error") {
        return None;
    }
    Some(
        value
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("peer reported an error")
            .to_string(),
    )
}

fn decode_retrieval(tool: &str, result: &CallToolResult) -> Result<RetrievalResult, SessionError> {
    let text = result
        .first_text()
        .ok_or_else(|| SessionError::Protocol(format!("{tool} reply has no text content")))?;

    if let Some(message) = reported_failure(text) {
        return Err(SessionError::Tool {
            tool: tool.to_string(),
            message,
        });
    }

    serde_json::from_str(text)
        .map_err(|e| SessionError::Protocol(format!("{tool} reply is not a retrieval result: {e}")))
}
