//! OpenAI chat completions backend.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::backend::{BackendError, ChatMessage, LlmBackend};
use crate::sanitize::sanitize_api_error;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI (or OpenAI-compatible) chat completions backend.
pub struct OpenAiBackend {
    name: String,
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: Option<f64>,
    max_tokens: Option<i64>,
}

impl OpenAiBackend {
    /// Create a backend talking to `base_url` (which includes the `/v1` prefix).
    pub fn new(
        name: impl Into<String>,
        api_key: Option<&str>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let name = name.into();
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| {
                BackendError::Config {
                    backend: name.clone(),
                    message: "API key contains invalid header characters".into(),
                }
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Config {
                backend: name.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            name,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
        })
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: Option<i64>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request_error(&self, err: &reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout {
                backend: self.name.clone(),
            }
        } else {
            BackendError::Request {
                backend: self.name.clone(),
                message: sanitize_api_error(&err.to_string()),
            }
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, BackendError> {
        let start = Instant::now();
        let request = OpenAiRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| OpenAiMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read provider error body>".to_string());
            return Err(BackendError::Status {
                backend: self.name.clone(),
                status: status.as_u16(),
                body: sanitize_api_error(&body),
            });
        }

        let parsed: OpenAiResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.request_error(&e)
            } else {
                BackendError::Decode {
                    backend: self.name.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::Empty {
                backend: self.name.clone(),
            })?;

        tracing::debug!(
            backend = %self.name,
            model = %self.model,
            messages = messages.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            total_tokens = parsed.usage.map(|u| u.total_tokens),
            "LLM generation complete"
        );

        Ok(content)
    }
}

// ============================================================================
// OpenAI API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    total_tokens: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer, key: Option<&str>) -> OpenAiBackend {
        OpenAiBackend::new(
            "openai",
            key,
            format!("{}/v1", server.uri()),
            "gpt-4o-mini",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("You are a helpful assistant."),
            ChatMessage::user("My cat is Miso"),
            ChatMessage::assistant("Nice name!"),
            ChatMessage::user("What is my cat called?"),
        ]
    }

    #[test]
    fn request_serialization() {
        let messages = conversation();
        let request = OpenAiRequest {
            model: "gpt-4o-mini",
            messages: messages
                .iter()
                .map(|m| OpenAiMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            max_tokens: None,
            temperature: Some(0.7),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][3]["content"], "What is my cat called?");
        assert!(value.get("max_tokens").is_none());
    }

    #[tokio::test]
    async fn generate_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "messages": [
                    {"role": "system", "content": "You are a helpful assistant."},
                    {"role": "user", "content": "My cat is Miso"},
                    {"role": "assistant", "content": "Nice name!"},
                    {"role": "user", "content": "What is my cat called?"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-mini",
                "choices": [{"message": {"role": "assistant", "content": "Your cat is Miso."}}],
                "usage": {"prompt_tokens": 20, "completion_tokens": 5, "total_tokens": 25}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reply = backend(&server, Some("sk-test"))
            .generate(&conversation())
            .await
            .unwrap();
        assert_eq!(reply, "Your cat is Miso.");
    }

    #[tokio::test]
    async fn error_status_is_sanitized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string("Incorrect API key provided: sk-live-secret123"),
            )
            .mount(&server)
            .await;

        let err = backend(&server, Some("sk-live-secret123"))
            .generate(&conversation())
            .await
            .unwrap_err();

        match err {
            BackendError::Status { status, body, .. } => {
                assert_eq!(status, 401);
                assert!(!body.contains("secret123"));
                assert!(body.contains("[REDACTED]"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_content_is_empty_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let err = backend(&server, None)
            .generate(&conversation())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Empty { .. }));
    }

    #[tokio::test]
    async fn malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = backend(&server, None)
            .generate(&conversation())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Decode { .. }));
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"choices": []}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(
            "openai",
            None,
            format!("{}/v1", server.uri()),
            "gpt-4o-mini",
            Duration::from_millis(100),
        )
        .unwrap();

        let err = backend.generate(&conversation()).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let backend = OpenAiBackend::new(
            "openai",
            None,
            "http://localhost:8080/v1/",
            "m",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(backend.endpoint(), "http://localhost:8080/v1/chat/completions");
    }
}
