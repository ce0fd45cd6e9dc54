use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use halo_core::config::AppConfig;

use crate::middleware;
use crate::routes;
use crate::state::AppState;

/// Routes, body limit, request ids, and CORS around the given state.
pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.gateway.body_limit_bytes;
    Router::new()
        // OpenAI-compatible API
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route("/v1/images/generations", post(routes::image_generations))
        .route("/v1/models", get(routes::list_models))
        // Ops
        .route("/api/health", get(routes::health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum::middleware::from_fn(middleware::assign_request_id))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// OpenAI-compatible HTTP gateway built on axum.
pub struct GatewayServer {
    config: AppConfig,
}

impl GatewayServer {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let bind = self.config.gateway.bind.clone();
        let state = Arc::new(AppState::new(self.config.clone()));
        let app = build_router(state);

        let listener = TcpListener::bind(&bind).await?;
        info!(
            bind = %bind,
            provider = %self.config.defaults.provider,
            model = %self.config.defaults.model,
            auth = !self.config.gateway.api_keys.is_empty(),
            "Gateway listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
