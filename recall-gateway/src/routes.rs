//! Route definitions for the Recall gateway.

use crate::auth::{auth_middleware, AuthState, AuthUser};
use crate::user::{User, UserStore};
use axum::{
    extract::{DefaultBodyLimit, Extension, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use recall_core::{ChatError, ChatOrchestrator, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Shown when a chat turn fails because the user's memory session is gone.
pub const RECONNECT_MESSAGE: &str = "Not connected to memory service. Please login again.";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub auth: AuthState,
    pub user_store: Arc<UserStore>,
    pub orchestrator: Arc<ChatOrchestrator>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_in: u64,
    pub user: UserResponse,
}

/// Public view of a user.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: String,
    pub username: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
    pub active_sessions: usize,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}

/// Build the router: public health and login, authenticated logout and chat.
pub fn build_router(state: AppState, body_limit_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = Router::new()
        .route("/api/v1/auth/logout", post(logout_handler))
        .route("/api/v1/chat", post(chat_handler))
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/auth/login", post(login_handler))
        .merge(protected)
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        service: "recall-gateway".into(),
        active_sessions: state.orchestrator.registry().active_count().await,
    })
}

/// Verify credentials, issue a token and open the user's memory session.
async fn login_handler(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let invalid = || {
        api_error(
            StatusCode::UNAUTHORIZED,
            "Invalid credentials",
            "AUTH_INVALID_CREDENTIALS",
        )
    };

    if request.username.is_empty() || request.password.is_empty() {
        return Err(invalid());
    }

    let user = state
        .user_store
        .verify_password(&request.username, &request.password)
        .map_err(|e| {
            tracing::error!(error = %e, "Password verification error");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Authentication error",
                "AUTH_ERROR",
            )
        })?;

    let Some(user) = user else {
        tracing::info!(username = %request.username, "Login rejected");
        return Err(invalid());
    };

    let user_id = UserId::new(user.id.clone()).map_err(|e| {
        tracing::error!(error = %e, "Stored user id is not usable as a session key");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Authentication error",
            "AUTH_ERROR",
        )
    })?;

    let token = state.auth.generate_token(user_id.as_str()).map_err(|e| {
        tracing::error!(error = %e, "Failed to generate token");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to generate token",
            "AUTH_TOKEN_ERROR",
        )
    })?;

    // Pre-warm; chat will retry creation if this fails.
    match state.orchestrator.registry().acquire(&user_id).await {
        Ok(_lease) => tracing::info!(user_id = %user_id, "Memory session ready"),
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Could not open memory session at login")
        }
    }

    Ok(Json(LoginResponse {
        token,
        expires_in: state.auth.token_expiry_secs,
        user: user.into(),
    }))
}

/// Close the caller's memory session.
async fn logout_handler(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Json<serde_json::Value> {
    state.orchestrator.registry().release(&auth_user.user_id).await;
    tracing::info!(user_id = %auth_user.user_id, "User logged out");
    Json(serde_json::json!({ "status": "ok" }))
}

async fn chat_handler(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let message = request.message.trim();
    if message.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Message cannot be empty",
            "CHAT_EMPTY_MESSAGE",
        ));
    }

    let reply = state
        .orchestrator
        .handle_chat_turn(&auth_user.user_id, message)
        .await
        .map_err(chat_error_response)?;

    Ok(Json(ChatResponse {
        response: reply.response,
        warning: reply.warning.map(|w| w.message),
    }))
}

fn chat_error_response(err: ChatError) -> ApiError {
    if err.is_session_class() {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            RECONNECT_MESSAGE,
            "MEMORY_UNAVAILABLE",
        );
    }

    match err {
        ChatError::Backend(e) => api_error(
            StatusCode::BAD_GATEWAY,
            format!("Language model request failed: {e}"),
            "LLM_ERROR",
        ),
        ChatError::Retrieval(message) => api_error(
            StatusCode::BAD_GATEWAY,
            format!("Memory retrieval failed: {message}"),
            "MEMORY_RETRIEVAL_ERROR",
        ),
        other => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            other.to_string(),
            "INTERNAL_ERROR",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall_core::SessionError;
    use recall_llm::BackendError;

    #[test]
    fn session_failures_ask_for_login() {
        let (status, Json(body)) =
            chat_error_response(ChatError::from(SessionError::PeerUnavailable("gone".into())));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.error, RECONNECT_MESSAGE);

        let (status, _) = chat_error_response(ChatError::SessionUnavailable(
            SessionError::MissingTool("add_memory".into()),
        ));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn backend_failures_are_bad_gateway() {
        let (status, Json(body)) = chat_error_response(ChatError::Backend(BackendError::Timeout {
            backend: "openai".into(),
        }));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body.code, "LLM_ERROR");
    }

    #[test]
    fn retrieval_tool_errors_are_bad_gateway() {
        let (status, Json(body)) =
            chat_error_response(ChatError::Retrieval("memoryos not initialized".into()));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body.error.contains("memoryos not initialized"));
    }
}
