//! HTTP surface: the orchestrator's sole entry point.
//!
//! Routes: `POST /exec`, `POST /upload`, `GET /download/{session}/{file}`,
//! `GET /health`, `GET /health/detailed`. Request concurrency is bounded
//! by a tower layer; everything behind it is async and backpressured by
//! the pool's own acquisition timeout.

mod handlers;

pub use handlers::{DetailedHealth, ExecRequestDto, ExecResponseDto, UploadRequestDto};

use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tracing::info;

use crate::config::Settings;
use crate::error::Error;
use crate::exec::Orchestrator;
use crate::files::FileStore;
use crate::sandbox::SandboxPool;
use crate::state::StateStore;

/// Largest accepted request body; leaves headroom for inline input files.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Shared handler state, wired once at startup.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub pool: SandboxPool,
    pub state_store: Arc<StateStore>,
    pub files: Arc<FileStore>,
    pub settings: Settings,
    pub started_at: Instant,
}

/// Builds the service router.
#[must_use]
pub fn router(state: AppState) -> Router {
    let max_inflight = state.settings.max_inflight;
    Router::new()
        .route("/exec", post(handlers::exec))
        .route("/upload", post(handlers::upload))
        .route("/download/{session_id}/{file_id}", get(handlers::download))
        .route("/health", get(handlers::health))
        .route("/health/detailed", get(handlers::health_detailed))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(ConcurrencyLimitLayer::new(max_inflight))
        .with_state(state)
}

/// Serves until ctrl-c.
pub async fn run(state: AppState) -> Result<(), Error> {
    let bind = state.settings.bind.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;
    Ok(())
}
