//! Error types for sessions and chat turns.

use recall_llm::BackendError;
use recall_mcp::McpError;
use std::time::Duration;
use thiserror::Error;

/// Failure of a memory session operation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to prepare session config: {0}")]
    Config(String),

    #[error("failed to start memory peer: {0}")]
    Launch(#[source] McpError),

    #[error("memory peer did not become ready within {}s", .0.as_secs())]
    StartupTimeout(Duration),

    #[error("memory peer does not provide tool {0}")]
    MissingTool(String),

    #[error("memory session was released")]
    Released,

    #[error("memory peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("memory peer protocol error: {0}")]
    Protocol(String),

    #[error("memory call {tool} timed out")]
    Timeout { tool: String },

    #[error("memory tool {tool} reported an error: {message}")]
    Tool { tool: String, message: String },
}

impl SessionError {
    /// Classify a client error raised while calling `tool`.
    pub fn from_mcp(tool: &str, err: McpError) -> Self {
        match err {
            McpError::Timeout { .. } => Self::Timeout {
                tool: tool.to_string(),
            },
            McpError::Protocol(message) => Self::Protocol(message),
            McpError::NotInitialized => Self::Protocol("client not initialized".into()),
            McpError::Rpc { message, .. } => Self::Tool {
                tool: tool.to_string(),
                message,
            },
            McpError::Cancelled => Self::Released,
            other => Self::PeerUnavailable(other.to_string()),
        }
    }

    /// The session's channel can no longer be trusted and should be evicted.
    pub const fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            Self::PeerUnavailable(_) | Self::Released | Self::Protocol(_) | Self::Timeout { .. }
        )
    }

    /// The peer is gone (as opposed to answering badly or slowly).
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::PeerUnavailable(_) | Self::Released)
    }

    /// Failed while bringing a session up.
    pub const fn is_creation_failure(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Launch(_) | Self::StartupTimeout(_) | Self::MissingTool(_)
        )
    }
}

/// Failure of a chat turn as seen by the caller.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("memory session unavailable: {0}")]
    SessionUnavailable(#[source] SessionError),

    #[error("memory peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("memory peer protocol error: {0}")]
    Protocol(String),

    #[error("language model failed: {0}")]
    Backend(#[from] BackendError),

    #[error("memory retrieval failed: {0}")]
    Retrieval(String),
}

impl ChatError {
    /// The "please retry / log in again" class of failures.
    pub const fn is_session_class(&self) -> bool {
        matches!(
            self,
            Self::SessionUnavailable(_) | Self::PeerUnavailable(_) | Self::Protocol(_)
        )
    }
}

impl From<SessionError> for ChatError {
    fn from(err: SessionError) -> Self {
        match err {
            gone @ (SessionError::PeerUnavailable(_)
            | SessionError::Released
            | SessionError::Timeout { .. }) => Self::PeerUnavailable(gone.to_string()),
            SessionError::Protocol(message) => Self::Protocol(message),
            SessionError::Tool { message, .. } => Self::Retrieval(message),
            creation => Self::SessionUnavailable(creation),
        }
    }
}
