/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier assigned to a job by the generation backend (a ComfyUI `prompt_id`).
pub type JobId = String;
