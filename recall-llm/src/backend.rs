//! Backend trait and message types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Messages
// ============================================================================

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error from a language model backend. Messages are already sanitized.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("[{backend}] backend not configured: {message}")]
    Config { backend: String, message: String },

    #[error("[{backend}] request failed: {message}")]
    Request { backend: String, message: String },

    #[error("[{backend}] request timed out")]
    Timeout { backend: String },

    #[error("[{backend}] API error ({status}): {body}")]
    Status {
        backend: String,
        status: u16,
        body: String,
    },

    #[error("[{backend}] failed to parse response: {message}")]
    Decode { backend: String, message: String },

    #[error("[{backend}] response contained no text")]
    Empty { backend: String },

    #[error("unknown backend: {0}")]
    Unknown(String),
}

// ============================================================================
// Backend Trait
// ============================================================================

/// A text generator that turns an ordered conversation into a reply.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Backend name (e.g. "openai").
    fn name(&self) -> &str;

    /// Model the backend generates with.
    fn model(&self) -> &str;

    /// Generate the assistant reply for `messages`.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, BackendError>;
}
