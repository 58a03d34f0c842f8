//! Shared helpers for worker integration tests.

#![allow(dead_code)]

use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use comfyrun_comfyui::backend::{BackendError, BackendStatus, FetchedFile, GenerationBackend};
use comfyrun_comfyui::bridge::{BridgeSettings, JobBridge};
use comfyrun_comfyui::history::OutputFile;
use comfyrun_core::types::JobId;
use comfyrun_worker::router::build_app_router;
use comfyrun_worker::state::AppState;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

/// Backend whose jobs finish immediately with a single PNG.
pub struct StubBackend {
    pub healthy: bool,
}

pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nstub";

impl GenerationBackend for StubBackend {
    async fn submit(&self, _workflow: &Value, request_token: &str) -> Result<JobId, BackendError> {
        Ok(request_token.to_string())
    }

    async fn status(&self, _job_id: &str) -> Result<BackendStatus, BackendError> {
        Ok(BackendStatus::Succeeded)
    }

    async fn outputs(&self, _job_id: &str) -> Result<Vec<OutputFile>, BackendError> {
        Ok(vec![OutputFile {
            filename: "ComfyUI_00001_.png".to_string(),
            subfolder: String::new(),
            folder_type: "output".to_string(),
        }])
    }

    async fn fetch(&self, _file: &OutputFile) -> Result<FetchedFile, BackendError> {
        Ok(FetchedFile {
            bytes: PNG_BYTES.to_vec(),
            content_type: Some("image/png".to_string()),
        })
    }

    fn view_url(&self, file: &OutputFile) -> String {
        format!("stub://{}", file.filename)
    }

    async fn cancel(&self, _job_id: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn health(&self) -> Result<(), BackendError> {
        if self.healthy {
            Ok(())
        } else {
            Err(BackendError::Unreachable("connection refused".to_string()))
        }
    }
}

/// Build the full application router around a stub backend.
pub fn build_test_app(healthy: bool) -> Router {
    let bridge = JobBridge::new(StubBackend { healthy }, BridgeSettings::default());
    build_app_router(AppState::new(bridge), Duration::from_secs(30))
}

pub async fn get(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_raw(app: Router, uri: &str, body: &str) -> Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response {
    post_raw(app, uri, &body.to_string()).await
}

pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
