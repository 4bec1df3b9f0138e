//! HTTP control surface (§2.1, §4.10, §4.11): health/metrics for operators
//! and dashboards, plus a `POST /control` fallback for environments that
//! can't reach the message bus directly. Reuses the existing logging and
//! rate-limiting middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use crate::control::{ControlCommand, RunState};
use crate::health::HealthMonitor;
use crate::middleware::{RateLimitConfig, RateLimitLayer};

#[derive(Clone)]
pub struct ApiState {
    pub health: Arc<HealthMonitor>,
    pub run_state: RunState,
    pub queue_depth: Arc<parking_lot::RwLock<usize>>,
}

pub fn router(state: ApiState) -> Router {
    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/control", post(control_handler))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn_with_state(
            rate_limiter,
            crate::middleware::rate_limit::rate_limit_middleware,
        ))
        .with_state(state)
}

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let depth = *state.queue_depth.read();
    Json(state.health.snapshot(depth))
}

async fn metrics_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let depth = *state.queue_depth.read();
    Json(state.health.snapshot(depth))
}

async fn control_handler(
    State(state): State<ApiState>,
    Json(command): Json<ControlCommand>,
) -> impl IntoResponse {
    state.run_state.apply(command);
    Json(serde_json::json!({"success": true}))
}

/// Spawns the axum server bound to `addr`; returns once the server exits.
pub async fn serve(addr: SocketAddr, state: ApiState) -> std::io::Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
