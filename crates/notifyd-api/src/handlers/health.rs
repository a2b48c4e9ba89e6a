//! Health endpoint with a database connectivity probe.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// Health check body.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service status: `healthy` or `unhealthy`.
    pub status: &'static str,
    /// Database probe result: `up` or `down`.
    pub database: &'static str,
    /// Service version.
    pub version: &'static str,
}

/// `GET /health` — lightweight probe for load balancers and orchestration.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    match state.storage.health_check().await {
        Ok(()) => {
            debug!("health check passed");
            (
                StatusCode::OK,
                Json(HealthResponse {
                    status: "healthy",
                    database: "up",
                    version: env!("CARGO_PKG_VERSION"),
                }),
            )
                .into_response()
        },
        Err(e) => {
            error!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy",
                    database: "down",
                    version: env!("CARGO_PKG_VERSION"),
                }),
            )
                .into_response()
        },
    }
}
