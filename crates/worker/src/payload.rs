//! Request payloads for one-shot local runs.

use std::path::{Path, PathBuf};

use serde_json::Value;

/// File read by `run` when no input is given on the command line.
pub const DEFAULT_INPUT_FILE: &str = "test_input.json";

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid JSON in {origin}: {source}")]
    Parse {
        origin: String,
        source: serde_json::Error,
    },
}

/// Resolve the payload for a local run.
///
/// Precedence: inline JSON, then an explicit file, then `default_file`
/// if it exists, then an empty `{"input": {}}` request.
pub fn load_payload(
    inline: Option<&str>,
    file: Option<&Path>,
    default_file: &Path,
) -> Result<Value, PayloadError> {
    if let Some(json) = inline {
        return parse(json, "--test-input");
    }

    let path = match file {
        Some(path) => path,
        None if default_file.is_file() => default_file,
        None => {
            tracing::info!(
                path = %default_file.display(),
                "No input given and no default input file, using an empty request",
            );
            return Ok(serde_json::json!({"input": {}}));
        }
    };

    let text = std::fs::read_to_string(path).map_err(|source| PayloadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text, &path.display().to_string())
}

fn parse(json: &str, origin: &str) -> Result<Value, PayloadError> {
    serde_json::from_str(json).map_err(|source| PayloadError::Parse {
        origin: origin.to_string(),
        source,
    })
}
