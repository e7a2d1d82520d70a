//! Health check endpoints.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    mode: String,
}

/// Basic health check (is the agent running?)
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        mode: state.mode().to_string(),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    api_server: bool,
}

/// Readiness check (does the local API server answer?)
pub async fn ready_check(
    State(state): State<AppState>,
) -> Result<Json<ReadyResponse>, StatusCode> {
    if state.kube.api_ready().await {
        Ok(Json(ReadyResponse {
            status: "ready",
            api_server: true,
        }))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}
