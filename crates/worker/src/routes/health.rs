use std::time::Duration;

use axum::extract::State;
use axum::{routing::get, Json, Router};
use comfyrun_comfyui::backend::GenerationBackend;
use serde::Serialize;

use crate::state::AppState;

/// Upper bound on the backend reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether ComfyUI answered the probe.
    pub backend_healthy: bool,
}

/// GET /health -- returns service and backend health.
async fn health_check<B: GenerationBackend + 'static>(
    State(state): State<AppState<B>>,
) -> Json<HealthResponse> {
    let backend_healthy = matches!(
        tokio::time::timeout(PROBE_TIMEOUT, state.bridge.backend().health()).await,
        Ok(Ok(()))
    );

    let status = if backend_healthy { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        backend_healthy,
    })
}

pub fn router<B: GenerationBackend + 'static>() -> Router<AppState<B>> {
    Router::new().route("/health", get(health_check::<B>))
}
