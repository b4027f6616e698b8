//! Recall Common - Shared configuration, logging and utilities.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Logging setup with noise filtering
//! - Small helpers used across the Recall crates

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod logging;
pub mod util;

pub use config::{
    AuthConfig, ChatConfig, Config, DatabaseConfig, LlmConfig, MemoryConfig, ObservabilityConfig,
    RetrievalFailurePolicy, ServerConfig,
};
pub use logging::init_logging;
