//! Health and admin HTTP handlers
//!
//! Reusable axum handlers consumed by the admin UI:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probe (`/ready`)
//! - Queue stats and connection health (`/queue/*`)
//! - DLQ inspection and retry/breaker administration (`/admin/*`)
//! - Prometheus metrics (`/metrics`)

use crate::metrics;
use crate::service::QueueService;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// Shared state for the admin endpoints.
#[derive(Clone)]
pub struct AdminState {
    pub service: Arc<QueueService>,
    pub app_name: String,
    pub app_version: String,
}

impl AdminState {
    pub fn new(
        service: Arc<QueueService>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            service,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Liveness probe handler. Always returns OK while the process is up.
pub async fn health_handler(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "name": state.app_name,
        "version": state.app_version,
    }))
}

/// Readiness probe handler: ready once the broker connection is established.
pub async fn ready_handler(
    State(state): State<AdminState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let status = state.service.connection_status();

    if status.connection.connected {
        Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "broker": "ok" }
            })),
        ))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": {
                    "broker": format!(
                        "disconnected (reconnect attempt {}/{})",
                        status.connection.reconnect_attempt,
                        status.connection.max_reconnect_attempts
                    )
                }
            })),
        ))
    }
}

/// Job counts grouped by status.
///
/// `GET /queue/stats`
pub async fn stats_handler(
    State(state): State<AdminState>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    match state.service.stats().await {
        Ok(stats) => Ok(Json(stats)),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// Broker connection plus circuit breaker snapshot.
///
/// `GET /queue/connection`
pub async fn connection_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.service.connection_status())
}

/// Get DLQ statistics.
///
/// `GET /admin/dlq/stats`
pub async fn dlq_stats_handler(
    State(state): State<AdminState>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    match state.service.dead_letter_stats().await {
        Ok(stats) => Ok(Json(stats)),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// Query parameters for DLQ list and retry endpoints.
#[derive(Debug, Deserialize)]
pub struct LimitParams {
    /// Maximum number of items to touch (default: 10, max: 100)
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

/// Inspect DLQ messages without consuming them.
///
/// `GET /admin/dlq/messages?limit=10`
pub async fn dlq_messages_handler(
    State(state): State<AdminState>,
    Query(params): Query<LimitParams>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let limit = params.limit.min(100);

    match state.service.dlq_messages(limit).await {
        Ok(messages) => {
            let count = messages.len();
            Ok(Json(json!({
                "messages": messages,
                "limit": limit,
                "count": count
            })))
        }
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// Re-queue failed jobs that are still under their attempt limit.
///
/// `POST /admin/jobs/retry?limit=10`
pub async fn retry_handler(
    State(state): State<AdminState>,
    Query(params): Query<LimitParams>,
) -> impl IntoResponse {
    let limit = params.limit.min(100);
    let retried = state.service.retry_failed_jobs(limit as i64).await;

    Json(json!({
        "success": true,
        "retried": retried,
        "limit": limit
    }))
}

/// Force the circuit breaker closed.
///
/// `POST /admin/circuit-breaker/reset`
pub async fn reset_breaker_handler(State(state): State<AdminState>) -> impl IntoResponse {
    state.service.reset_circuit_breaker();

    Json(json!({
        "success": true,
        "message": "Circuit breaker reset to CLOSED"
    }))
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Router with health, queue, DLQ admin, and metrics endpoints.
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        // Queue observability
        .route("/queue/stats", get(stats_handler))
        .route("/queue/connection", get(connection_handler))
        // Admin endpoints
        .route("/admin/dlq/stats", get(dlq_stats_handler))
        .route("/admin/dlq/messages", get(dlq_messages_handler))
        .route("/admin/jobs/retry", post(retry_handler))
        .route("/admin/circuit-breaker/reset", post(reset_breaker_handler))
        // Metrics
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
