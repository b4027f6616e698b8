//! Configuration management for Recall services.
//!
//! All Recall services share a single configuration file at `~/.recall/config.json`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (RECALL_* prefix, plus the OpenAI conventions)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `RECALL_HOST` → server.host
//! - `RECALL_PORT` → server.port
//! - `RECALL_JWT_SECRET` → auth.jwt_secret
//! - `RECALL_LOG_LEVEL` → observability.log_level
//! - `RECALL_LOG_FORMAT` → observability.log_format
//! - `RECALL_MEMORY_COMMAND` → memory.command (split on whitespace)
//! - `OPENAI_API_KEY` → llm.api_key
//! - `OPENAI_BASE_URL` → llm.base_url

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".recall"),
        |dirs| dirs.home_dir().join(".recall"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Expand `~` and environment variables in a configured path.
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).as_ref()),
    }
}

// ============================================================================
// Server
// ============================================================================

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum accepted request body size in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    5001
}

fn default_body_limit() -> usize {
    64 * 1024
}

// ============================================================================
// Auth
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Secret used to sign session tokens. Falls back to a generated
    /// per-process secret when unset.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    #[serde(default = "default_token_expiry")]
    pub token_expiry_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_expiry_secs: default_token_expiry(),
        }
    }
}

fn default_token_expiry() -> u64 {
    24 * 60 * 60
}

// ============================================================================
// Memory peer
// ============================================================================

/// Configuration for the per-user memory subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Program and arguments used to start a memory peer.
    #[serde(default = "default_memory_command")]
    pub command: Vec<String>,

    /// Flag placed before the per-user config path on the command line.
    #[serde(default = "default_config_flag")]
    pub config_flag: String,

    /// Base JSON template that every per-user config is derived from.
    #[serde(default = "default_base_config")]
    pub base_config: String,

    /// Directory holding the generated per-user config files.
    #[serde(default = "default_session_dir")]
    pub session_dir: String,

    /// Extra environment passed to every memory peer.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default = "default_retrieve_tool")]
    pub retrieve_tool: String,

    #[serde(default = "default_store_tool")]
    pub store_tool: String,

    /// Upper bound on spawn + handshake.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Upper bound on a single request/reply exchange.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long a peer gets to exit after stdin is closed before it is killed.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Sessions idle longer than this are closed. 0 disables reaping.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            command: default_memory_command(),
            config_flag: default_config_flag(),
            base_config: default_base_config(),
            session_dir: default_session_dir(),
            env: HashMap::new(),
            retrieve_tool: default_retrieve_tool(),
            store_tool: default_store_tool(),
            startup_timeout_secs: default_startup_timeout(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

impl MemoryConfig {
    pub fn base_config_path(&self) -> PathBuf {
        expand_path(&self.base_config)
    }

    pub fn session_dir_path(&self) -> PathBuf {
        expand_path(&self.session_dir)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// `None` when idle reaping is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

fn default_memory_command() -> Vec<String> {
    vec!["python3".into(), "memoryos-mcp/server_new.py".into()]
}

fn default_config_flag() -> String {
    "--config".into()
}

fn default_base_config() -> String {
    "memoryos-mcp/config.json".into()
}

fn default_session_dir() -> String {
    "~/.recall/sessions".into()
}

fn default_retrieve_tool() -> String {
    "retrieve_memory".into()
}

fn default_store_tool() -> String {
    "add_memory".into()
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    2000
}

fn default_idle_timeout() -> u64 {
    30 * 60
}

fn default_reap_interval() -> u64 {
    60
}

// ============================================================================
// LLM
// ============================================================================

/// LLM backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Registered backend name (e.g. "openai", "openai-compatible")
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub temperature: Option<f64>,

    #[serde(default)]
    pub max_tokens: Option<i64>,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key: None,
            base_url: None,
            temperature: None,
            max_tokens: None,
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_llm_provider() -> String {
    "openai".into()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".into()
}

fn default_llm_timeout() -> u64 {
    120
}

// ============================================================================
// Chat pipeline
// ============================================================================

/// What a chat turn does when memory retrieval fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalFailurePolicy {
    /// Fail the whole turn.
    #[default]
    Fail,
    /// Continue with an empty memory set.
    Degrade,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default)]
    pub on_retrieval_failure: RetrievalFailurePolicy,

    /// Re-create the session once and retry when a reused peer turns out dead.
    #[serde(default)]
    pub retry_dead_peer: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            on_retrieval_failure: RetrievalFailurePolicy::default(),
            retry_dead_peer: false,
        }
    }
}

fn default_system_prompt() -> String {
    "You are a helpful assistant.".into()
}

// ============================================================================
// Database / Observability
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_path(&self.path)
    }
}

fn default_db_path() -> String {
    "~/.recall/recall.db".into()
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets forced to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration (default path or `path`), apply environment
    /// overrides and validate.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => Self::load()?,
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("RECALL_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("RECALL_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(secret) = lookup("RECALL_JWT_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }
        if let Some(level) = lookup("RECALL_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = lookup("RECALL_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        if let Some(command) = lookup("RECALL_MEMORY_COMMAND") {
            self.memory.command = command.split_whitespace().map(String::from).collect();
        }
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.llm.base_url = Some(url);
        }
    }

    /// Reject configurations the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.memory.command.is_empty() || self.memory.command[0].trim().is_empty() {
            bail!("memory.command must name a program");
        }
        if self.memory.retrieve_tool.is_empty() || self.memory.store_tool.is_empty() {
            bail!("memory.retrieve_tool and memory.store_tool must not be empty");
        }
        if self.memory.startup_timeout_secs == 0 || self.memory.request_timeout_secs == 0 {
            bail!("memory timeouts must be greater than zero");
        }
        if self.llm.timeout_secs == 0 {
            bail!("llm.timeout_secs must be greater than zero");
        }
        if self.llm.model.trim().is_empty() {
            bail!("llm.model must not be empty");
        }
        Ok(())
    }
}
