//! Bringing up memory sessions.

use async_trait::async_trait;
use recall_common::MemoryConfig;
use recall_mcp::McpClient;
use std::path::Path;
use std::time::Instant;

use super::config_file::write_session_config;
use super::memory::{MemorySession, MemoryTools};
use crate::error::SessionError;
use crate::identity::UserId;

/// Creates a ready-to-use memory session for a user.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(&self, user: &UserId) -> Result<MemorySession, SessionError>;
}

/// Spawns the configured memory peer as a child process speaking MCP on stdio.
pub struct StdioLauncher {
    config: MemoryConfig,
}

impl StdioLauncher {
    pub fn new(config: MemoryConfig) -> Self {
        Self { config }
    }

    fn tools(&self) -> MemoryTools {
        MemoryTools {
            retrieve: self.config.retrieve_tool.clone(),
            store: self.config.store_tool.clone(),
        }
    }

    fn argv(&self, config_path: &Path) -> Vec<String> {
        let mut argv = self.config.command.clone();
        argv.push(self.config.config_flag.clone());
        argv.push(config_path.display().to_string());
        argv
    }

    async fn connect(&self, user: &UserId, config_path: &Path) -> Result<McpClient, SessionError> {
        let client = McpClient::connect_stdio(
            format!("memory:{user}"),
            &self.argv(config_path),
            &self.config.env,
            self.config.request_timeout(),
            self.config.shutdown_grace(),
        )
        .await
        .map_err(SessionError::Launch)?;

        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                let _ = client.close().await;
                return Err(SessionError::Launch(e));
            }
        };

        for required in [&self.config.retrieve_tool, &self.config.store_tool] {
            if !tools.iter().any(|t| &t.name == required) {
                let _ = client.close().await;
                return Err(SessionError::MissingTool(required.clone()));
            }
        }

        Ok(client)
    }
}

#[async_trait]
impl SessionLauncher for StdioLauncher {
    async fn launch(&self, user: &UserId) -> Result<MemorySession, SessionError> {
        let started = Instant::now();
        let config = write_session_config(
            &self.config.base_config_path(),
            &self.config.session_dir_path(),
            user,
        )
        .await?;

        let startup_timeout = self.config.startup_timeout();
        let connected = tokio::time::timeout(startup_timeout, self.connect(user, config.path())).await;

        let client = match connected {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                config.remove().await;
                return Err(e);
            }
            Err(_) => {
                // the child is killed when the dropped transport drops it
                config.remove().await;
                return Err(SessionError::StartupTimeout(startup_timeout));
            }
        };

        tracing::info!(
            user_id = %user,
            elapsed_ms = started.elapsed().as_millis() as u64,
            config = %config.path().display(),
            "Memory session started"
        );

        Ok(MemorySession::new(
            user.clone(),
            client,
            self.tools(),
            Some(config),
        ))
    }
}
