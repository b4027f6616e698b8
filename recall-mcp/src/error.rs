//! Error types for MCP communication.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`McpError`].
pub type Result<T> = std::result::Result<T, McpError>;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("MCP server command cannot be empty")]
    EmptyCommand,

    #[error("Failed to spawn MCP server {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The peer hung up: EOF on stdout, broken pipe on stdin, or the
    /// transport was already closed.
    #[error("MCP server closed connection")]
    Closed,

    #[error("MCP I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent something that is not a valid reply.
    #[error("MCP protocol error: {0}")]
    Protocol(String),

    /// The peer answered with a JSON-RPC error object.
    #[error("MCP {method} failed: {message} ({code})")]
    Rpc {
        method: String,
        code: i32,
        message: String,
    },

    #[error("MCP request {method} timed out after {}ms", .elapsed.as_millis())]
    Timeout { method: String, elapsed: Duration },

    #[error("MCP client not initialized")]
    NotInitialized,

    #[error("MCP request cancelled")]
    Cancelled,
}

impl McpError {
    /// The channel to the peer is gone and no further request can succeed.
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Closed | Self::Io(_) | Self::Cancelled)
    }

    /// The peer replied, but not in a way the client can interpret.
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Map an I/O error from a pipe, treating hang-ups as [`McpError::Closed`].
    pub fn from_pipe(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => Self::Closed,
            _ => Self::Io(err),
        }
    }
}
