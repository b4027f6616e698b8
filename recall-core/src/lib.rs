//! Recall Core - per-user memory sessions and the chat turn pipeline.
//!
//! - [`SessionRegistry`] keeps at most one live [`MemorySession`] per user
//!   and serializes that user's turns.
//! - [`ChatOrchestrator`] runs retrieve → generate → store for one message.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod error;
pub mod identity;
pub mod orchestrator;
pub mod registry;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{ChatError, SessionError};
pub use identity::{InvalidUserId, UserId};
pub use orchestrator::{build_conversation, ChatOrchestrator, PersistenceWarning, TurnReply};
pub use registry::{SessionLease, SessionRegistry};
pub use session::{
    MemorySession, MemorySnippet, MemoryTools, RetrievalResult, SessionLauncher, StdioLauncher,
};
