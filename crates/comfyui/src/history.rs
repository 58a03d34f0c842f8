//! Typed views of ComfyUI `/queue` and `/history/{id}` responses.
//!
//! ComfyUI reports a prompt in the queue while it is pending or running
//! and only writes a history entry once execution has ended. This module
//! turns both shapes into [`BackendStatus`] values and output file lists.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backend::BackendStatus;

/// Output keys that carry downloadable files in a node's output object.
pub const FILE_OUTPUT_KEYS: &[&str] = &["images", "gifs", "videos"];

/// Folder type ComfyUI uses for preview images; never returned as an artifact.
const TEMP_FOLDER_TYPE: &str = "temp";

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Response of `GET /queue`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue_running: Vec<QueueEntry>,
    #[serde(default)]
    pub queue_pending: Vec<QueueEntry>,
}

/// One queue item: `[number, prompt_id, prompt, extra_data, outputs_to_execute]`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueEntry(pub Vec<Value>);

impl QueueEntry {
    pub fn prompt_id(&self) -> Option<&str> {
        self.0.get(1).and_then(Value::as_str)
    }
}

impl QueueSnapshot {
    pub fn is_running(&self, prompt_id: &str) -> bool {
        self.queue_running
            .iter()
            .any(|e| e.prompt_id() == Some(prompt_id))
    }

    pub fn is_pending(&self, prompt_id: &str) -> bool {
        self.queue_pending
            .iter()
            .any(|e| e.prompt_id() == Some(prompt_id))
    }

    /// Queue-derived status, or `None` when the prompt is not queued.
    pub fn status_of(&self, prompt_id: &str) -> Option<BackendStatus> {
        if self.is_running(prompt_id) {
            Some(BackendStatus::Running)
        } else if self.is_pending(prompt_id) {
            Some(BackendStatus::Pending)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// A single prompt's history entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryEntry {
    /// Node id -> node output object, in the order ComfyUI reported them.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// The `status` block of a history entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// Execution events as `[event_name, payload]` pairs.
    #[serde(default)]
    pub messages: Vec<(String, Value)>,
}

/// A file produced by an output node, as addressed by `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// Problems with the `outputs` block of a history entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputListError {
    #[error("output entry of node {node} has no filename")]
    MissingFilename { node: String },

    #[error("malformed outputs for node {node}: {reason}")]
    Malformed { node: String, reason: String },
}

/// Look up and parse the entry for `prompt_id` in a `/history/{id}` body.
///
/// `Ok(None)` means ComfyUI has no history for the prompt (the body is `{}`).
pub fn parse_history_entry(
    history: &Value,
    prompt_id: &str,
) -> Result<Option<HistoryEntry>, serde_json::Error> {
    match history.get(prompt_id) {
        None => Ok(None),
        Some(entry) => HistoryEntry::deserialize(entry).map(Some),
    }
}

impl HistoryEntry {
    /// Terminal status recorded for the prompt.
    ///
    /// Entries written by ComfyUI builds without a `status` block are
    /// treated as succeeded, since history is only written after execution.
    pub fn status(&self) -> BackendStatus {
        let Some(status) = &self.status else {
            return BackendStatus::Succeeded;
        };

        match status.status_str.as_deref() {
            Some("success") => BackendStatus::Succeeded,
            Some("error") => BackendStatus::Failed(status.failure_reason()),
            _ if status.completed => BackendStatus::Succeeded,
            _ => BackendStatus::Failed(status.failure_reason()),
        }
    }

    /// Downloadable output files, node order first, then file order.
    ///
    /// Preview (`temp`) files are skipped.
    pub fn output_files(&self) -> Result<Vec<OutputFile>, OutputListError> {
        let mut files = Vec::new();

        for (node, output) in &self.outputs {
            let Some(output) = output.as_object() else {
                return Err(OutputListError::Malformed {
                    node: node.clone(),
                    reason: "node output is not an object".to_string(),
                });
            };

            for (key, items) in output {
                if !FILE_OUTPUT_KEYS.contains(&key.as_str()) {
                    continue;
                }
                let Some(items) = items.as_array() else {
                    return Err(OutputListError::Malformed {
                        node: node.clone(),
                        reason: format!("'{key}' is not a list"),
                    });
                };
                for item in items {
                    if let Some(file) = parse_output_file(node, item)? {
                        files.push(file);
                    }
                }
            }
        }

        Ok(files)
    }
}

fn parse_output_file(node: &str, item: &Value) -> Result<Option<OutputFile>, OutputListError> {
    let has_filename = item
        .get("filename")
        .and_then(Value::as_str)
        .is_some_and(|f| !f.is_empty());
    if !has_filename {
        return Err(OutputListError::MissingFilename {
            node: node.to_string(),
        });
    }

    let file = OutputFile::deserialize(item).map_err(|e| OutputListError::Malformed {
        node: node.to_string(),
        reason: e.to_string(),
    })?;

    if file.folder_type == TEMP_FOLDER_TYPE {
        return Ok(None);
    }
    Ok(Some(file))
}

impl HistoryStatus {
    /// Best description of why execution ended without success.
    fn failure_reason(&self) -> String {
        for (event, data) in &self.messages {
            match event.as_str() {
                "execution_error" => {
                    let message = data
                        .get("exception_message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error")
                        .trim();
                    let node_id = data.get("node_id").and_then(Value::as_str);
                    let node_type = data.get("node_type").and_then(Value::as_str);
                    return match (node_type, node_id) {
                        (Some(ty), Some(id)) => format!("{ty} (node {id}): {message}"),
                        (None, Some(id)) => format!("node {id}: {message}"),
                        _ => message.to_string(),
                    };
                }
                "execution_interrupted" => return "execution interrupted".to_string(),
                _ => {}
            }
        }
        "execution did not complete".to_string()
    }
}
