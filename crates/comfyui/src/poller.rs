//! Completion polling with exponential backoff.
//!
//! [`await_completion`] repeatedly asks the backend for a job's status
//! until it reaches a terminal state, the deadline passes, or the
//! [`CancellationToken`] fires. Waits are `tokio` timers raced against
//! the token, so a cancelled invocation stops between polls without
//! waiting out its delay.

use std::time::Duration;

use comfyrun_core::job::{Job, JobState};
use comfyrun_core::types::JobId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, BackendStatus, GenerationBackend};

/// Factor by which the poll interval grows after each status query.
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// The interval never grows past this multiple of the initial interval.
const MAX_GROWTH: u32 = 5;

/// Upper bound on a best-effort cancel request.
pub(crate) const CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Reason given when the backend has no record of the job.
pub const JOB_NOT_FOUND_REASON: &str = "job not found on backend";

/// Tunable parameters for one polling run.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    /// Delay before the second status query.
    pub poll_interval: Duration,
    /// Hard upper bound on the delay between queries.
    pub max_poll_interval: Duration,
    /// Give up once this much time has passed since polling started.
    pub timeout: Duration,
    /// Consecutive failed status queries tolerated before giving up.
    pub max_retries: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
            max_retries: 3,
        }
    }
}

impl PollSettings {
    /// `min(5 × poll_interval, max_poll_interval)`.
    pub fn delay_cap(&self) -> Duration {
        self.poll_interval.saturating_mul(MAX_GROWTH).min(self.max_poll_interval)
    }

    /// Deadline for polling that starts at `now`.
    pub fn deadline_from(&self, now: Instant) -> Instant {
        now.checked_add(self.timeout).unwrap_or_else(|| now + FAR_FUTURE)
    }
}

/// Calculate the next poll delay from the current one.
///
/// The result is clamped to [`PollSettings::delay_cap`].
pub fn next_delay(current: Duration, settings: &PollSettings) -> Duration {
    let next_ms = (current.as_millis() as f64 * BACKOFF_MULTIPLIER) as u64;
    Duration::from_millis(next_ms).min(settings.delay_cap())
}

/// How a job that reached a terminal backend state ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    Failed { reason: String },
}

/// Polling stopped before the job finished.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("job {job_id} did not finish within {timeout:?}")]
    Timeout { job_id: JobId, timeout: Duration },

    #[error("status checks for job {job_id} failed {attempts} times in a row: {source}")]
    Poll {
        job_id: JobId,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("job {job_id} was cancelled")]
    Cancelled { job_id: JobId },
}

/// Poll until `job` reaches a terminal backend state.
///
/// On return `job` is in `succeeded`, `failed`, `timed_out` or
/// `cancelled`. Whenever polling gives up on a job that may still be
/// running (timeout, cancellation, exhausted retries) a best-effort
/// cancel is sent to the backend.
pub async fn await_completion<B: GenerationBackend>(
    backend: &B,
    job: &mut Job,
    settings: &PollSettings,
    cancel: &CancellationToken,
) -> Result<Completion, CompletionError> {
    let deadline = settings.deadline_from(Instant::now());
    let mut delay = settings.poll_interval;
    let mut failures = 0u32;
    let mut polls = 0u32;

    loop {
        polls += 1;
        let queried = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(backend, job).await),
            result = tokio::time::timeout_at(deadline, backend.status(job.id())) => result,
        };

        match queried {
            Err(_) => return Err(timed_out(backend, job, settings).await),
            Ok(Ok(status)) => {
                failures = 0;
                tracing::debug!(job_id = job.id(), poll = polls, ?status, "Job status");
                match status {
                    BackendStatus::Pending => {}
                    BackendStatus::Running => mark(job, JobState::Running),
                    BackendStatus::Succeeded => {
                        mark(job, JobState::Succeeded);
                        tracing::info!(
                            job_id = job.id(),
                            polls,
                            elapsed_ms = job.elapsed_ms(),
                            "Job succeeded",
                        );
                        return Ok(Completion::Succeeded);
                    }
                    BackendStatus::Failed(reason) => {
                        mark(job, JobState::Failed);
                        tracing::warn!(
                            job_id = job.id(),
                            reason = %reason,
                            "Job failed on backend",
                        );
                        return Ok(Completion::Failed { reason });
                    }
                    BackendStatus::Unknown => {
                        mark(job, JobState::Failed);
                        tracing::warn!(job_id = job.id(), "Job not found on backend");
                        return Ok(Completion::Failed {
                            reason: JOB_NOT_FOUND_REASON.to_string(),
                        });
                    }
                }
            }
            Ok(Err(e)) => {
                failures += 1;
                if failures > settings.max_retries {
                    tracing::error!(
                        job_id = job.id(),
                        attempts = failures,
                        error = %e,
                        "Giving up on status checks",
                    );
                    mark(job, JobState::Failed);
                    cancel_on_backend(backend, job.id(), CANCEL_TIMEOUT).await;
                    return Err(CompletionError::Poll {
                        job_id: job.id().to_string(),
                        attempts: failures,
                        source: e,
                    });
                }
                tracing::warn!(
                    job_id = job.id(),
                    attempt = failures,
                    max_retries = settings.max_retries,
                    error = %e,
                    "Status check failed, will retry",
                );
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out(backend, job, settings).await);
        }
        let wait = delay.min(remaining);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(backend, job).await),
            _ = tokio::time::sleep(wait) => {}
        }
        delay = next_delay(delay, settings);
    }
}

/// Advance `job`, logging instead of failing on an impossible transition.
fn mark(job: &mut Job, state: JobState) {
    if let Err(e) = job.advance(state) {
        tracing::warn!(job_id = job.id(), error = %e, "Ignoring job state change");
    }
}

/// The cancel is bounded by one poll interval so the timeout is reported
/// no later than `timeout + poll_interval`.
async fn timed_out<B: GenerationBackend>(
    backend: &B,
    job: &mut Job,
    settings: &PollSettings,
) -> CompletionError {
    mark(job, JobState::TimedOut);
    tracing::warn!(
        job_id = job.id(),
        timeout_ms = settings.timeout.as_millis() as u64,
        "Job timed out",
    );
    let budget = CANCEL_TIMEOUT.min(settings.poll_interval);
    cancel_on_backend(backend, job.id(), budget).await;
    CompletionError::Timeout {
        job_id: job.id().to_string(),
        timeout: settings.timeout,
    }
}

async fn cancelled<B: GenerationBackend>(backend: &B, job: &mut Job) -> CompletionError {
    mark(job, JobState::Cancelled);
    tracing::info!(job_id = job.id(), "Invocation cancelled, stopping job");
    cancel_on_backend(backend, job.id(), CANCEL_TIMEOUT).await;
    CompletionError::Cancelled {
        job_id: job.id().to_string(),
    }
}

/// Best-effort backend cancel; failures are only logged.
pub(crate) async fn cancel_on_backend<B: GenerationBackend>(
    backend: &B,
    job_id: &str,
    budget: Duration,
) {
    match tokio::time::timeout(budget, backend.cancel(job_id)).await {
        Ok(Ok(())) => tracing::debug!(job_id, "Backend cancel sent"),
        Ok(Err(e)) => tracing::warn!(job_id, error = %e, "Backend cancel failed"),
        Err(_) => tracing::warn!(job_id, "Backend cancel timed out"),
    }
}
