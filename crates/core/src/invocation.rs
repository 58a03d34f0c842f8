//! Inbound request envelope and the consolidated invocation result.
//!
//! Requests arrive as `{"input": {"workflow": {...}, ...}}`. The result
//! is always a well-formed [`InvocationResult`], serialized with a
//! `status` tag of `success` or `error`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::artifact::Artifact;
use crate::error::CoreError;
use crate::types::JobId;

/// Per-invocation overrides for the bridge's configured defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvocationOptions {
    /// `input.timeout_secs`: completion timeout.
    pub timeout: Option<Duration>,
    /// `input.poll_interval_ms`: initial status poll interval.
    pub poll_interval: Option<Duration>,
    /// `input.submit_timeout_secs`: timeout for the submission call.
    pub submit_timeout: Option<Duration>,
}

/// A request split into its workflow and its options.
///
/// The workflow is left unvalidated; see [`crate::workflow::validate`].
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub workflow: Option<Value>,
    pub options: InvocationOptions,
}

impl InvocationRequest {
    /// Split a raw request payload.
    ///
    /// A missing `input` is treated as an empty one, so the request fails
    /// later with the "no workflow" reason rather than a shape error.
    pub fn from_payload(payload: Value) -> Result<Self, CoreError> {
        let mut envelope = match payload {
            Value::Object(map) => map,
            _ => {
                return Err(CoreError::Validation(
                    "Request must be a JSON object".to_string(),
                ))
            }
        };

        let mut input = match envelope.remove("input") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(CoreError::Validation(
                    "Request 'input' must be a JSON object".to_string(),
                ))
            }
        };

        let options = InvocationOptions {
            timeout: positive_u64(&input, "timeout_secs")?.map(Duration::from_secs),
            poll_interval: positive_u64(&input, "poll_interval_ms")?.map(Duration::from_millis),
            submit_timeout: positive_u64(&input, "submit_timeout_secs")?
                .map(Duration::from_secs),
        };

        Ok(Self {
            workflow: input.remove("workflow"),
            options,
        })
    }
}

/// Read an optional strictly-positive integer field from `input`.
fn positive_u64(input: &Map<String, Value>, field: &str) -> Result<Option<u64>, CoreError> {
    match input.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => match value.as_u64() {
            Some(n) if n > 0 => Ok(Some(n)),
            _ => Err(CoreError::Validation(format!(
                "'{field}' must be a positive integer, got {value}"
            ))),
        },
    }
}

/// The single value returned for every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum InvocationResult {
    Success {
        message: String,
        workflow_nodes: usize,
        job_id: JobId,
        artifacts: Vec<Artifact>,
    },
    Error {
        message: String,
    },
}

impl InvocationResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Success { message, .. } | Self::Error { message } => message,
        }
    }
}
