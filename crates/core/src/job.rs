//! Job lifecycle state machine.
//!
//! A [`Job`] is created in [`JobState::Submitted`] by the submission
//! client and moved forward by the completion poller. Transitions are
//! monotonic: a job never moves backwards and never leaves a terminal
//! state.

use std::fmt;

use serde::Serialize;

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

/// Lifecycle state of a backend job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    /// Whether no further transition is allowed out of this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Position in the lifecycle. All terminal states share the last rank.
    fn rank(self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::Running => 1,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled => 2,
        }
    }

    /// Snake-case name, matching the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One backend-tracked unit of work for a single invocation.
#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,
    state: JobState,
    submitted_at: Timestamp,
    finished_at: Option<Timestamp>,
}

impl Job {
    /// A freshly accepted job, as acknowledged by the backend.
    pub fn submitted(id: impl Into<JobId>) -> Self {
        Self {
            id: id.into(),
            state: JobState::Submitted,
            submitted_at: chrono::Utc::now(),
            finished_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn submitted_at(&self) -> Timestamp {
        self.submitted_at
    }

    /// Set once, when the job reaches a terminal state.
    pub fn finished_at(&self) -> Option<Timestamp> {
        self.finished_at
    }

    /// Wall-clock milliseconds between submission and the terminal state
    /// (or now, while the job is still in flight).
    pub fn elapsed_ms(&self) -> i64 {
        let end = self.finished_at.unwrap_or_else(chrono::Utc::now);
        (end - self.submitted_at).num_milliseconds()
    }

    /// Move the job to `next`.
    ///
    /// Re-entering the current non-terminal state is a no-op. Moving
    /// backwards, or out of any terminal state, is rejected.
    pub fn advance(&mut self, next: JobState) -> Result<(), CoreError> {
        if self.state == next && !next.is_terminal() {
            return Ok(());
        }
        if self.state.is_terminal() || next.rank() < self.state.rank() {
            return Err(CoreError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }

        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(chrono::Utc::now());
        }
        Ok(())
    }
}
