//! Produced outputs of a succeeded job.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Content type used when neither the backend nor the file extension
/// tells us anything better.
pub const FALLBACK_KIND: &str = "application/octet-stream";

/// One produced output, in the shape returned to the caller.
///
/// Serializes as `{"kind": "...", "data": "<base64>"}` or
/// `{"kind": "...", "ref": "<url>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Content type, e.g. `image/png`.
    pub kind: String,
    #[serde(flatten)]
    pub payload: ArtifactPayload,
}

/// Either the artifact bytes themselves or where to fetch them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactPayload {
    /// Base64-encoded file contents.
    Data(String),
    /// Absolute URL the file can be retrieved from.
    Ref(String),
}

impl Artifact {
    pub fn inline(kind: impl Into<String>, base64_data: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: ArtifactPayload::Data(base64_data.into()),
        }
    }

    pub fn reference(kind: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: ArtifactPayload::Ref(url.into()),
        }
    }
}

/// How collected artifacts are handed back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArtifactDelivery {
    /// Fetch every file and embed it as base64.
    #[default]
    Inline,
    /// Return backend URLs without fetching.
    Reference,
}

impl ArtifactDelivery {
    /// Parse from the `ARTIFACT_DELIVERY` setting (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self, CoreError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(Self::Inline),
            "reference" | "ref" => Ok(Self::Reference),
            other => Err(CoreError::Validation(format!(
                "Unknown artifact delivery '{other}'. Must be one of: inline, reference"
            ))),
        }
    }
}

/// Guess a content type from a file name's extension.
pub fn kind_from_filename(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "json" => "application/json",
        "txt" => "text/plain",
        _ => FALLBACK_KIND,
    }
}
