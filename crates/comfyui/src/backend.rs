//! The generation backend boundary.
//!
//! [`GenerationBackend`] is the narrow surface the bridge needs from a
//! generation server. [`ComfyUIApi`] implements it over HTTP; tests
//! substitute an in-memory backend.

use std::future::Future;

use comfyrun_core::types::JobId;
use serde_json::Value;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::{parse_history_entry, OutputFile};

/// Backend-reported status of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    /// Accepted and waiting in the queue.
    Pending,
    Running,
    Succeeded,
    /// Execution ended with an error; carries the backend's reason.
    Failed(String),
    /// Neither queued nor in history.
    Unknown,
}

/// A downloaded output file.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Failure talking to the backend, classified by what the caller can do about it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The request never produced an HTTP reply (connection, DNS, timeout).
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend replied with a non-success status.
    #[error("backend rejected the request: {0}")]
    Rejected(String),

    /// The backend replied successfully but the body could not be understood.
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

/// Operations the job bridge performs against a generation server.
pub trait GenerationBackend: Send + Sync {
    /// Queue a workflow under the caller-chosen `request_token`.
    ///
    /// Returns the backend's job id for the queued work.
    fn submit(
        &self,
        workflow: &Value,
        request_token: &str,
    ) -> impl Future<Output = Result<JobId, BackendError>> + Send;

    fn status(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<BackendStatus, BackendError>> + Send;

    /// Output files of a finished job, in backend order.
    fn outputs(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Vec<OutputFile>, BackendError>> + Send;

    fn fetch(
        &self,
        file: &OutputFile,
    ) -> impl Future<Output = Result<FetchedFile, BackendError>> + Send;

    /// Where `file` can be downloaded from without going through this process.
    fn view_url(&self, file: &OutputFile) -> String;

    /// Ask the backend to drop or stop the job.
    fn cancel(&self, job_id: &str) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Cheap reachability probe.
    fn health(&self) -> impl Future<Output = Result<(), BackendError>> + Send;
}

impl From<ComfyUIApiError> for BackendError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::Request(e) if e.is_decode() => Self::Malformed(e.to_string()),
            ComfyUIApiError::Request(e) => Self::Unreachable(e.to_string()),
            ComfyUIApiError::ApiError { status, body } => {
                Self::Rejected(rejection_reason(status, &body))
            }
        }
    }
}

/// Summarise a ComfyUI error body.
///
/// `/prompt` answers an invalid graph with
/// `{"error": {"message", "details"}, "node_errors": {id: {"class_type", "errors": [...]}}}`;
/// anything else is passed through as text.
fn rejection_reason(status: u16, body: &str) -> String {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        let body = body.trim();
        return if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {body}")
        };
    };

    let mut parts = Vec::new();
    if let Some(error) = json.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .unwrap_or("request rejected");
        match error.get("details").and_then(Value::as_str) {
            Some(details) if !details.is_empty() => parts.push(format!("{message}: {details}")),
            _ => parts.push(message.to_string()),
        }
    }

    if let Some(node_errors) = json.get("node_errors").and_then(Value::as_object) {
        for (node, info) in node_errors {
            let class_type = info.get("class_type").and_then(Value::as_str).unwrap_or("?");
            let errors = info
                .get("errors")
                .and_then(Value::as_array)
                .map(|errors| {
                    errors
                        .iter()
                        .filter_map(|e| e.get("message").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            parts.push(format!("node {node} ({class_type}): {errors}"));
        }
    }

    if parts.is_empty() {
        format!("HTTP {status}: {body}")
    } else {
        format!("HTTP {status}: {}", parts.join("; "))
    }
}

impl GenerationBackend for ComfyUIApi {
    async fn submit(&self, workflow: &Value, request_token: &str) -> Result<JobId, BackendError> {
        let response = self
            .submit_workflow(workflow, request_token, request_token)
            .await?;

        if response
            .node_errors
            .as_object()
            .is_some_and(|errors| !errors.is_empty())
        {
            tracing::warn!(
                prompt_id = %response.prompt_id,
                node_errors = %response.node_errors,
                "ComfyUI queued prompt with node errors",
            );
        }
        tracing::debug!(
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Prompt queued",
        );

        if response.prompt_id.is_empty() {
            return Err(BackendError::Malformed(
                "acknowledgement carried an empty prompt_id".to_string(),
            ));
        }
        Ok(response.prompt_id)
    }

    async fn status(&self, job_id: &str) -> Result<BackendStatus, BackendError> {
        // Queue first: a prompt finishing between the two calls is then
        // still found in history.
        let queue = self.get_queue().await?;
        if let Some(status) = queue.status_of(job_id) {
            return Ok(status);
        }

        let history = self.get_history(job_id).await?;
        let entry = parse_history_entry(&history, job_id)
            .map_err(|e| BackendError::Malformed(format!("history for {job_id}: {e}")))?;

        Ok(entry.map_or(BackendStatus::Unknown, |entry| entry.status()))
    }

    async fn outputs(&self, job_id: &str) -> Result<Vec<OutputFile>, BackendError> {
        let history = self.get_history(job_id).await?;
        let entry = parse_history_entry(&history, job_id)
            .map_err(|e| BackendError::Malformed(format!("history for {job_id}: {e}")))?
            .ok_or_else(|| BackendError::Malformed(format!("no history for {job_id}")))?;

        entry
            .output_files()
            .map_err(|e| BackendError::Malformed(e.to_string()))
    }

    async fn fetch(&self, file: &OutputFile) -> Result<FetchedFile, BackendError> {
        let response = self.view(file).await?;
        Ok(FetchedFile {
            bytes: response.bytes,
            content_type: response.content_type,
        })
    }

    fn view_url(&self, file: &OutputFile) -> String {
        ComfyUIApi::view_url(self, file)
    }

    async fn cancel(&self, job_id: &str) -> Result<(), BackendError> {
        self.cancel_execution(job_id).await?;

        // Deleting from the queue does not stop a prompt that already started.
        if self.get_queue().await?.is_running(job_id) {
            self.interrupt().await?;
        }
        Ok(())
    }

    async fn health(&self) -> Result<(), BackendError> {
        self.system_stats().await?;
        Ok(())
    }
}
