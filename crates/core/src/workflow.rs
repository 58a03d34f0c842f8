//! Structural validation of incoming ComfyUI workflows.
//!
//! A workflow is an object keyed by node id. Node definitions are opaque
//! here: only presence, shape and node count are checked, so a rejected
//! workflow never reaches the backend.

use serde_json::Value;

use crate::error::CoreError;

/// Maximum serialized workflow size in bytes (10 MB).
pub const MAX_WORKFLOW_JSON_SIZE: usize = 10_000_000;

/// Reason used when the request carries no workflow at all.
pub const MISSING_WORKFLOW_REASON: &str = "No workflow provided in input";

/// A workflow that passed [`validate`].
#[derive(Debug, Clone)]
pub struct Workflow {
    json: Value,
    node_count: usize,
}

impl Workflow {
    /// The workflow exactly as it will be submitted.
    pub fn as_json(&self) -> &Value {
        &self.json
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }
}

/// Validate the raw value found under the request's `workflow` key.
///
/// `None` and JSON `null` both mean "absent".
pub fn validate(raw: Option<Value>) -> Result<Workflow, CoreError> {
    let json = match raw {
        None | Some(Value::Null) => {
            return Err(CoreError::Validation(MISSING_WORKFLOW_REASON.to_string()))
        }
        Some(json) => json,
    };

    let node_count = match json.as_object() {
        Some(nodes) => nodes.len(),
        None => {
            return Err(CoreError::Validation(
                "Workflow must be a JSON object mapping node ids to node definitions".to_string(),
            ))
        }
    };

    if node_count == 0 {
        return Err(CoreError::Validation(
            "Workflow must contain at least one node".to_string(),
        ));
    }

    validate_workflow_json_size(&json)?;

    Ok(Workflow { json, node_count })
}

/// Validate that a workflow JSON does not exceed the size limit.
pub fn validate_workflow_json_size(json: &Value) -> Result<(), CoreError> {
    let serialized = serde_json::to_vec(json)
        .map_err(|e| CoreError::Internal(format!("Failed to serialize workflow JSON: {e}")))?;
    if serialized.len() > MAX_WORKFLOW_JSON_SIZE {
        return Err(CoreError::Validation(format!(
            "Workflow JSON exceeds maximum size of {} bytes (got {} bytes)",
            MAX_WORKFLOW_JSON_SIZE,
            serialized.len()
        )));
    }
    Ok(())
}
