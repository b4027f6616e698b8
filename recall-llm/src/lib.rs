//! Language model backends for Recall.
//!
//! A backend turns an ordered, role-tagged conversation into reply text.
//! Backends are registered by name and resolved once from `llm.provider`.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod backend;
pub mod openai;
pub mod registry;
pub mod sanitize;

pub use backend::{BackendError, ChatMessage, LlmBackend, Role};
pub use openai::OpenAiBackend;
pub use registry::{BackendFactory, BackendRegistry};
pub use sanitize::{sanitize_api_error, scrub_secret_patterns};
