//! Model Context Protocol client for Recall memory peers.
//!
//! A memory peer is a child process speaking MCP over stdio. This crate
//! owns the wire format, the stdio transport and the request/response
//! client; session policy lives in `recall-core`.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod client;
pub mod error;
pub mod transport;
pub mod types;

pub use client::{McpClient, DEFAULT_REQUEST_TIMEOUT};
pub use error::{McpError, Result};
pub use transport::{StdioTransport, Transport, DEFAULT_SHUTDOWN_GRACE};
pub use types::{
    methods, CallToolResult, Implementation, JsonRpcError, JsonRpcId, JsonRpcRequest,
    JsonRpcResponse, McpTool, ToolContent, MCP_PROTOCOL_VERSION,
};
