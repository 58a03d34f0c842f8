//! Invocation endpoints.
//!
//! Both `/run` and `/runsync` block until the invocation finishes and
//! always answer `200 OK` with the [`InvocationResult`] as the body.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::{routing::post, Json, Router};
use comfyrun_comfyui::backend::GenerationBackend;
use comfyrun_core::invocation::InvocationResult;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

/// POST /run, POST /runsync -- run one invocation.
///
/// The invocation runs in its own task. If the client goes away, this
/// handler's future is dropped, the drop guard fires the token and the
/// backend job is cancelled.
async fn run_invocation<B: GenerationBackend + 'static>(
    State(state): State<AppState<B>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Json<InvocationResult> {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => {
            tracing::info!(error = %rejection, "Rejected request body");
            return Json(InvocationResult::error(format!(
                "Validation failed: invalid request body: {}",
                rejection.body_text()
            )));
        }
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let bridge = Arc::clone(&state.bridge);

    let handle = tokio::spawn(async move { bridge.run(payload, &cancel).await });
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "Invocation task failed");
            InvocationResult::error(format!("Internal error: invocation task failed: {e}"))
        }
    };

    guard.disarm();
    Json(result)
}

pub fn router<B: GenerationBackend + 'static>() -> Router<AppState<B>> {
    Router::new()
        .route("/run", post(run_invocation::<B>))
        .route("/runsync", post(run_invocation::<B>))
}
