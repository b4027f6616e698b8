//! Recall Gateway - HTTP surface for memory-backed chat.
//!
//! - Username/password login against a local SQLite user store, issuing JWTs
//! - One memory peer per logged-in user, opened at login and closed at logout
//! - Chat turns that read and write the user's memory around each reply
//!
//! ## Architecture
//!
//! ```text
//! Client → Gateway (auth) → ChatOrchestrator → SessionRegistry → memory peer (stdio MCP)
//!                                  ↓
//!                             LLM backend
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod auth;
pub mod routes;
pub mod user;

pub use auth::{AuthState, AuthUser};
pub use routes::{build_router, AppState};
pub use user::{User, UserStore};

use recall_common::Config;
use recall_core::{ChatOrchestrator, SessionRegistry, StdioLauncher};
use recall_llm::BackendRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Wire the user store, session registry, LLM backend and orchestrator from `config`.
pub fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let user_store = Arc::new(UserStore::new(&config.database.resolved_path())?);

    let launcher = Arc::new(StdioLauncher::new(config.memory.clone()));
    let registry = Arc::new(SessionRegistry::new(launcher));

    let backend = BackendRegistry::with_defaults().build(&config.llm)?;
    tracing::info!(
        backend = backend.name(),
        model = backend.model(),
        "LLM backend ready"
    );

    let orchestrator = Arc::new(ChatOrchestrator::new(
        registry,
        backend,
        config.chat.clone(),
        config.llm.timeout(),
    ));

    Ok(AppState {
        auth: AuthState::from_config(config.auth.jwt_secret.as_deref(), config.auth.token_expiry_secs),
        user_store,
        orchestrator,
    })
}

/// Start the gateway and serve until ctrl-c, then close every memory session.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    let state = build_state(config)?;
    let registry = Arc::clone(state.orchestrator.registry());
    let router = build_router(state, config.server.body_limit_bytes);

    let shutdown = CancellationToken::new();
    let reaper = config.memory.idle_timeout().map(|idle_timeout| {
        tracing::info!(
            idle_timeout_secs = idle_timeout.as_secs(),
            "Idle session reaper enabled"
        );
        registry.spawn_reaper(
            config.memory.reap_interval(),
            idle_timeout,
            shutdown.child_token(),
        )
    });

    tracing::info!("Starting Recall Gateway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down, closing memory sessions");
    shutdown.cancel();
    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }
    registry.shutdown_all().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
