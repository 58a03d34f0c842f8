use std::sync::Arc;

use comfyrun_comfyui::bridge::JobBridge;

/// Shared application state available to all Axum handlers via `State<AppState<B>>`.
///
/// Cheaply cloneable; the bridge is behind an `Arc`.
pub struct AppState<B> {
    pub bridge: Arc<JobBridge<B>>,
}

impl<B> AppState<B> {
    pub fn new(bridge: JobBridge<B>) -> Self {
        Self {
            bridge: Arc::new(bridge),
        }
    }
}

impl<B> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            bridge: Arc::clone(&self.bridge),
        }
    }
}
