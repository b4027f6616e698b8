//! Memory sessions: one MCP channel per user to a memory peer.

mod config_file;
mod launcher;
mod memory;

pub use config_file::{
    render_session_config, session_config_path, write_session_config, SessionConfigFile,
};
pub use launcher::{SessionLauncher, StdioLauncher};
pub use memory::{MemorySession, MemorySnippet, MemoryTools, RetrievalResult};
