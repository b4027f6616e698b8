//! Chat turn pipeline: retrieve memories, generate a reply, store the turn.

use recall_common::{ChatConfig, RetrievalFailurePolicy};
use recall_llm::{BackendError, ChatMessage, LlmBackend};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ChatError, SessionError};
use crate::identity::UserId;
use crate::registry::{SessionLease, SessionRegistry};
use crate::session::MemorySnippet;

/// The turn's reply was produced but could not be stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistenceWarning {
    pub message: String,
}

impl std::fmt::Display for PersistenceWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of a successful chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnReply {
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<PersistenceWarning>,
}

/// Assemble the model input: system preamble, one user/assistant pair per
/// remembered exchange (oldest first), then the new message.
pub fn build_conversation(
    system_prompt: &str,
    memories: &[MemorySnippet],
    message: &str,
) -> Vec<ChatMessage> {
    let mut conversation = Vec::with_capacity(memories.len() * 2 + 2);
    conversation.push(ChatMessage::system(system_prompt));
    for memory in memories {
        conversation.push(ChatMessage::user(&memory.user_input));
        conversation.push(ChatMessage::assistant(&memory.agent_response));
    }
    conversation.push(ChatMessage::user(message));
    conversation
}

/// Drives chat turns against users' memory sessions and an LLM backend.
pub struct ChatOrchestrator {
    registry: Arc<SessionRegistry>,
    backend: Arc<dyn LlmBackend>,
    config: ChatConfig,
    llm_timeout: Duration,
}

impl ChatOrchestrator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        backend: Arc<dyn LlmBackend>,
        config: ChatConfig,
        llm_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            backend,
            config,
            llm_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run one turn for `user`. The user's session is leased for the whole
    /// turn, so turns for the same user are applied in arrival order.
    pub async fn handle_chat_turn(
        &self,
        user: &UserId,
        message: &str,
    ) -> Result<TurnReply, ChatError> {
        let started = Instant::now();

        let mut lease = self.registry.acquire(user).await.map_err(|e| {
            tracing::warn!(user_id = %user, error = %e, "No memory session for chat turn");
            ChatError::SessionUnavailable(e)
        })?;

        let memories = self.retrieve(&mut lease, message).await?;
        let conversation = build_conversation(&self.config.system_prompt, &memories, message);
        let response = self.generate(user, &conversation).await?;
        let warning = self.persist(&lease, message, &response).await;

        tracing::info!(
            user_id = %user,
            memories = memories.len(),
            stored = warning.is_none(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Chat turn complete"
        );

        Ok(TurnReply { response, warning })
    }

    async fn retrieve(
        &self,
        lease: &mut SessionLease,
        message: &str,
    ) -> Result<Vec<MemorySnippet>, ChatError> {
        let err = match lease.retrieve_memory(message).await {
            Ok(result) => return Ok(result.short_term_memory),
            Err(e) => e,
        };

        let err = if err.is_peer_failure() {
            log_peer_failure(lease.user(), "retrieve", &err);
            let reused = lease.was_reused();
            lease.evict().await;

            if self.config.retry_dead_peer && reused && err.is_disconnect() {
                tracing::info!(user_id = %lease.user(), "Retrying retrieve on a fresh memory session");
                self.registry
                    .reopen(lease)
                    .await
                    .map_err(ChatError::SessionUnavailable)?;

                match lease.retrieve_memory(message).await {
                    Ok(result) => return Ok(result.short_term_memory),
                    Err(retry_err) => {
                        if retry_err.is_peer_failure() {
                            log_peer_failure(lease.user(), "retrieve", &retry_err);
                            lease.evict().await;
                        }
                        retry_err
                    }
                }
            } else {
                err
            }
        } else {
            err
        };

        match self.config.on_retrieval_failure {
            RetrievalFailurePolicy::Fail => Err(ChatError::from(err)),
            RetrievalFailurePolicy::Degrade => {
                tracing::warn!(
                    user_id = %lease.user(),
                    error = %err,
                    "Memory retrieval failed, continuing without memories"
                );
                Ok(Vec::new())
            }
        }
    }

    async fn generate(
        &self,
        user: &UserId,
        conversation: &[ChatMessage],
    ) -> Result<String, ChatError> {
        let generated =
            tokio::time::timeout(self.llm_timeout, self.backend.generate(conversation)).await;

        match generated {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                tracing::warn!(user_id = %user, backend = %self.backend.name(), error = %e, "LLM generation failed");
                Err(ChatError::Backend(e))
            }
            Err(_) => {
                tracing::warn!(
                    user_id = %user,
                    backend = %self.backend.name(),
                    timeout_secs = self.llm_timeout.as_secs(),
                    "LLM generation timed out"
                );
                Err(ChatError::Backend(BackendError::Timeout {
                    backend: self.backend.name().to_string(),
                }))
            }
        }
    }

    async fn persist(
        &self,
        lease: &SessionLease,
        message: &str,
        response: &str,
    ) -> Option<PersistenceWarning> {
        let err = lease.store_memory(message, response).await.err()?;

        if err.is_peer_failure() {
            log_peer_failure(lease.user(), "store", &err);
            lease.evict().await;
        } else {
            tracing::warn!(user_id = %lease.user(), error = %err, "Failed to store chat turn");
        }

        Some(PersistenceWarning {
            message: format!("Response was not saved to memory: {err}"),
        })
    }
}

fn log_peer_failure(user: &UserId, stage: &str, err: &SessionError) {
    if matches!(err, SessionError::Protocol(_)) {
        tracing::error!(user_id = %user, stage, kind = "protocol", error = %err, "Memory peer protocol error");
    } else {
        tracing::warn!(user_id = %user, stage, kind = "peer", error = %err, "Memory peer failure");
    }
}
