//! Per-invocation orchestration: validate, submit, await, collect.
//!
//! [`JobBridge::run`] never fails. Every stage failure is turned into a
//! [`BridgeError`] and then into an `error` [`InvocationResult`] whose
//! message names the stage and the underlying reason.

use std::time::Duration;

use comfyrun_core::artifact::ArtifactDelivery;
use comfyrun_core::error::CoreError;
use comfyrun_core::invocation::{InvocationOptions, InvocationRequest, InvocationResult};
use comfyrun_core::job::Job;
use comfyrun_core::types::JobId;
use comfyrun_core::workflow::{self, Workflow};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::backend::{BackendError, BackendStatus, GenerationBackend};
use crate::collector::{collect, CollectionError};
use crate::poller::{
    await_completion, cancel_on_backend, Completion, CompletionError, PollSettings, CANCEL_TIMEOUT,
};
use crate::submit::{submit, SubmissionError, SubmissionErrorKind};

/// Message of every successful result.
pub const SUCCESS_MESSAGE: &str = "Workflow completed";

/// Defaults applied to every invocation unless the request overrides them.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub job_timeout: Duration,
    pub submit_timeout: Duration,
    /// Wait before the single retry of an unreachable submission.
    pub submit_retry_delay: Duration,
    pub max_poll_retries: u32,
    pub delivery: ArtifactDelivery,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_poll_interval: Duration::from_secs(5),
            job_timeout: Duration::from_secs(600),
            submit_timeout: Duration::from_secs(30),
            submit_retry_delay: Duration::from_secs(1),
            max_poll_retries: 3,
            delivery: ArtifactDelivery::Inline,
        }
    }
}

impl BridgeSettings {
    fn poll_settings(&self, options: &InvocationOptions) -> PollSettings {
        PollSettings {
            poll_interval: options.poll_interval.unwrap_or(self.poll_interval),
            max_poll_interval: self.max_poll_interval,
            timeout: options.timeout.unwrap_or(self.job_timeout),
            max_retries: self.max_poll_retries,
        }
    }
}

/// Every way an invocation can fail, by stage.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("{0}")]
    Validation(CoreError),

    #[error("Submission failed: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Timed out: job {job_id} did not finish within {timeout:?}")]
    Timeout { job_id: JobId, timeout: Duration },

    #[error("Status polling failed for job {job_id} after {attempts} attempts: {source}")]
    Poll {
        job_id: JobId,
        attempts: u32,
        source: BackendError,
    },

    #[error("Artifact collection failed for job {job_id}: {source}")]
    Collection {
        job_id: JobId,
        source: CollectionError,
    },

    #[error("Job {job_id} failed on backend: {reason}")]
    BackendJobFailure { job_id: JobId, reason: String },

    #[error("Cancelled: {}", cancelled_message(.job_id))]
    Cancelled { job_id: Option<JobId> },
}

fn cancelled_message(job_id: &Option<JobId>) -> String {
    match job_id {
        Some(id) => format!("job {id} was cancelled"),
        None => "invocation cancelled before submission".to_string(),
    }
}

impl From<CompletionError> for BridgeError {
    fn from(err: CompletionError) -> Self {
        match err {
            CompletionError::Timeout { job_id, timeout } => Self::Timeout { job_id, timeout },
            CompletionError::Poll {
                job_id,
                attempts,
                source,
            } => Self::Poll {
                job_id,
                attempts,
                source,
            },
            CompletionError::Cancelled { job_id } => Self::Cancelled {
                job_id: Some(job_id),
            },
        }
    }
}

impl BridgeError {
    /// Short stage name used as a structured log field.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Submission(_) => "submission",
            Self::Timeout { .. } => "timeout",
            Self::Poll { .. } => "poll",
            Self::Collection { .. } => "collection",
            Self::BackendJobFailure { .. } => "backend_job",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

/// Runs invocations against one backend.
///
/// Holds no per-invocation state, so a single bridge can serve
/// concurrent invocations.
pub struct JobBridge<B> {
    backend: B,
    settings: BridgeSettings,
}

impl<B: GenerationBackend> JobBridge<B> {
    pub fn new(backend: B, settings: BridgeSettings) -> Self {
        Self { backend, settings }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Run one invocation to completion.
    ///
    /// `payload` is the raw `{"input": {...}}` request. Firing `cancel`
    /// stops the invocation and cancels the backend job if one exists.
    pub async fn run(&self, payload: Value, cancel: &CancellationToken) -> InvocationResult {
        let request_token = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("invocation", request_token = %request_token);

        async {
            match self.execute(payload, &request_token, cancel).await {
                Ok(result) => result,
                Err(e) => {
                    log_failure(&e);
                    InvocationResult::error(e.to_string())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        payload: Value,
        request_token: &str,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, BridgeError> {
        let request = InvocationRequest::from_payload(payload).map_err(BridgeError::Validation)?;
        let workflow = workflow::validate(request.workflow).map_err(BridgeError::Validation)?;
        tracing::info!(workflow_nodes = workflow.node_count(), "Workflow validated");

        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled { job_id: None });
        }

        let submit_timeout = request
            .options
            .submit_timeout
            .unwrap_or(self.settings.submit_timeout);
        let mut job = self
            .submit_with_retry(&workflow, request_token, submit_timeout, cancel)
            .await?;

        let poll_settings = self.settings.poll_settings(&request.options);
        match await_completion(&self.backend, &mut job, &poll_settings, cancel).await? {
            Completion::Succeeded => {}
            Completion::Failed { reason } => {
                return Err(BridgeError::BackendJobFailure {
                    job_id: job.id().to_string(),
                    reason,
                })
            }
        }

        let collected = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(job_id = job.id(), "Invocation cancelled during collection");
                return Err(BridgeError::Cancelled {
                    job_id: Some(job.id().to_string()),
                });
            }
            result = collect(&self.backend, &job, self.settings.delivery) => result,
        };
        let artifacts = collected.map_err(|source| BridgeError::Collection {
            job_id: job.id().to_string(),
            source,
        })?;

        Ok(InvocationResult::Success {
            message: SUCCESS_MESSAGE.to_string(),
            workflow_nodes: workflow.node_count(),
            job_id: job.id().to_string(),
            artifacts,
        })
    }

    /// Submit, retrying once if the backend was unreachable.
    ///
    /// The retry reuses `request_token`. Before resubmitting, the backend
    /// is asked whether the first attempt landed after all; if so that job
    /// is adopted instead of queuing the workflow twice.
    async fn submit_with_retry(
        &self,
        workflow: &Workflow,
        request_token: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Job, BridgeError> {
        let first = match self
            .submit_once(workflow, request_token, timeout, cancel)
            .await?
        {
            Ok(job) => return Ok(job),
            Err(e) if e.kind == SubmissionErrorKind::Unreachable => e,
            Err(e) => return Err(e.into()),
        };

        let delay = self.settings.submit_retry_delay;
        tracing::warn!(
            error = %first,
            delay_ms = delay.as_millis() as u64,
            "Submission failed, retrying once",
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.abandon_submission(request_token).await),
            _ = tokio::time::sleep(delay) => {}
        }

        let known = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(self.abandon_submission(request_token).await),
            result = tokio::time::timeout(timeout, self.backend.status(request_token)) => result,
        };
        match known {
            Ok(Ok(BackendStatus::Unknown)) => {}
            Ok(Ok(status)) => {
                tracing::info!(
                    job_id = request_token,
                    ?status,
                    "Backend already has the submission, adopting it",
                );
                return Ok(Job::submitted(request_token));
            }
            Ok(Err(e)) => tracing::debug!(error = %e, "Could not check for earlier submission"),
            Err(_) => tracing::debug!("Timed out checking for earlier submission"),
        }

        self.submit_once(workflow, request_token, timeout, cancel)
            .await?
            .map_err(BridgeError::from)
    }

    /// One submission attempt, abandoned if `cancel` fires first.
    async fn submit_once(
        &self,
        workflow: &Workflow,
        request_token: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Result<Job, SubmissionError>, BridgeError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(self.abandon_submission(request_token).await),
            result = submit(&self.backend, workflow, request_token, timeout) => Ok(result),
        }
    }

    /// The submission may have landed without an acknowledgement, so the
    /// token is cancelled on the backend too.
    async fn abandon_submission(&self, request_token: &str) -> BridgeError {
        tracing::info!(request_token, "Invocation cancelled during submission");
        cancel_on_backend(&self.backend, request_token, CANCEL_TIMEOUT).await;
        BridgeError::Cancelled { job_id: None }
    }
}

fn log_failure(err: &BridgeError) {
    let stage = err.stage();
    match err {
        BridgeError::Validation(_) => tracing::info!(stage, error = %err, "Invocation rejected"),
        BridgeError::Cancelled { .. } => {
            tracing::info!(stage, error = %err, "Invocation cancelled")
        }
        BridgeError::Timeout { .. } | BridgeError::BackendJobFailure { .. } => {
            tracing::warn!(stage, error = %err, "Invocation failed")
        }
        BridgeError::Submission(_) | BridgeError::Poll { .. } | BridgeError::Collection { .. } => {
            tracing::error!(stage, error = %err, "Invocation failed")
        }
    }
}
