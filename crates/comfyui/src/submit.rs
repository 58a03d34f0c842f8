//! Workflow submission.

use std::fmt;
use std::time::Duration;

use comfyrun_core::job::Job;
use comfyrun_core::workflow::Workflow;

use crate::backend::{BackendError, GenerationBackend};

/// Why a submission failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionErrorKind {
    /// No reply: connection failure or the submission timeout elapsed.
    Unreachable,
    /// The backend refused the workflow.
    Rejected,
    /// The backend accepted but its acknowledgement made no sense.
    Malformed,
}

impl fmt::Display for SubmissionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unreachable => "backend unreachable",
            Self::Rejected => "rejected by backend",
            Self::Malformed => "malformed acknowledgement",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {reason}")]
pub struct SubmissionError {
    pub kind: SubmissionErrorKind,
    pub reason: String,
}

impl From<BackendError> for SubmissionError {
    fn from(err: BackendError) -> Self {
        let (kind, reason) = match err {
            BackendError::Unreachable(reason) => (SubmissionErrorKind::Unreachable, reason),
            BackendError::Rejected(reason) => (SubmissionErrorKind::Rejected, reason),
            BackendError::Malformed(reason) => (SubmissionErrorKind::Malformed, reason),
        };
        Self { kind, reason }
    }
}

/// Send `workflow` to the backend once.
///
/// The call is bounded by `timeout`; elapsing counts as
/// [`SubmissionErrorKind::Unreachable`].
pub async fn submit<B: GenerationBackend>(
    backend: &B,
    workflow: &Workflow,
    request_token: &str,
    timeout: Duration,
) -> Result<Job, SubmissionError> {
    let submission = backend.submit(workflow.as_json(), request_token);
    let job_id = match tokio::time::timeout(timeout, submission).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(SubmissionError {
                kind: SubmissionErrorKind::Unreachable,
                reason: format!("no acknowledgement within {timeout:?}"),
            })
        }
    };

    tracing::info!(
        job_id = %job_id,
        request_token,
        workflow_nodes = workflow.node_count(),
        "Workflow submitted",
    );
    Ok(Job::submitted(job_id))
}
