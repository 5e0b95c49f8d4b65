//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{get, post},
};
use nudge_core::config::NudgeConfig;
use nudge_core::error::{NudgeError, Result};
use nudge_scheduler::DecisionEngine;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Environment variable with a comma-separated CORS origin allow-list.
pub const CORS_ORIGINS_ENV: &str = "NUDGE_CORS_ORIGINS";

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub config: NudgeConfig,
    pub start_time: std::time::Instant,
    /// Decision engine; owns the event store, timers, dispatcher and audit log.
    pub engine: Arc<DecisionEngine>,
}

impl AppState {
    pub fn new(config: NudgeConfig, engine: DecisionEngine) -> Self {
        Self {
            config,
            start_time: std::time::Instant::now(),
            engine: Arc::new(engine),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    Router::new()
        .route("/events", post(super::routes::post_event))
        .route("/dispatch-task", post(super::routes::dispatch_task))
        .route("/health", get(super::routes::health_check))
        .route("/api/v1/info", get(super::routes::system_info))
        .route("/api/v1/users/{user_id}", get(super::routes::get_user))
        .route("/api/v1/audit", get(super::routes::list_audit))
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: NUDGE_CORS_ORIGINS=https://app.example.com,https://admin.example.com
            if let Ok(origins_str) = std::env::var(CORS_ORIGINS_ENV) {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server with a decision engine wired from `config`.
pub async fn start(config: NudgeConfig) -> Result<()> {
    let engine = DecisionEngine::from_config(&config)?;
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let app = build_router(AppState::new(config, engine));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| NudgeError::Gateway(format!("Failed to bind {addr}: {e}")))?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| NudgeError::Gateway(format!("Server error: {e}")))?;
    Ok(())
}
