//! Name → constructor registry for language model backends.

use recall_common::LlmConfig;
use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{BackendError, LlmBackend};
use crate::openai::{OpenAiBackend, DEFAULT_BASE_URL};

/// Builds a backend from the `llm` config section.
pub type BackendFactory = fn(&LlmConfig) -> Result<Arc<dyn LlmBackend>, BackendError>;

/// Registry of backend constructors, resolved once at startup.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in `openai` and `openai-compatible` backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("openai", build_openai);
        registry.register("openai-compatible", build_openai_compatible);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Build the backend named by `config.provider`.
    pub fn build(&self, config: &LlmConfig) -> Result<Arc<dyn LlmBackend>, BackendError> {
        let factory = self
            .factories
            .get(&config.provider)
            .ok_or_else(|| BackendError::Unknown(config.provider.clone()))?;

        let backend = factory(config)?;
        tracing::info!(
            backend = %backend.name(),
            model = %backend.model(),
            "LLM backend ready"
        );
        Ok(backend)
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn build_openai(config: &LlmConfig) -> Result<Arc<dyn LlmBackend>, BackendError> {
    let api_key = config
        .api_key
        .as_deref()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| BackendError::Config {
            backend: "openai".into(),
            message: "llm.api_key (or OPENAI_API_KEY) is required".into(),
        })?;

    let backend = OpenAiBackend::new(
        "openai",
        Some(api_key),
        config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
        &config.model,
        config.timeout(),
    )?
    .with_temperature(config.temperature)
    .with_max_tokens(config.max_tokens);

    Ok(Arc::new(backend))
}

/// Self-hosted servers speaking the OpenAI wire format; the key is optional.
fn build_openai_compatible(config: &LlmConfig) -> Result<Arc<dyn LlmBackend>, BackendError> {
    let base_url = config
        .base_url
        .as_deref()
        .ok_or_else(|| BackendError::Config {
            backend: "openai-compatible".into(),
            message: "llm.base_url is required".into(),
        })?;

    let backend = OpenAiBackend::new(
        "openai-compatible",
        config.api_key.as_deref(),
        base_url,
        &config.model,
        config.timeout(),
    )?
    .with_temperature(config.temperature)
    .with_max_tokens(config.max_tokens);

    Ok(Arc::new(backend))
}
