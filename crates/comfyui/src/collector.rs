//! Artifact collection for succeeded jobs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use comfyrun_core::artifact::{kind_from_filename, Artifact, ArtifactDelivery, FALLBACK_KIND};
use comfyrun_core::job::{Job, JobState};
use comfyrun_core::types::JobId;
use futures::future::try_join_all;

use crate::backend::{BackendError, GenerationBackend};
use crate::history::OutputFile;

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("job {job_id} is {state}, only succeeded jobs have outputs")]
    NotSucceeded { job_id: JobId, state: JobState },

    /// The output listing itself could not be retrieved.
    #[error("could not list outputs: {0}")]
    Unavailable(BackendError),

    /// One of the output files could not be downloaded.
    #[error("failed to fetch {filename}: {source}")]
    PartialFetch {
        filename: String,
        #[source]
        source: BackendError,
    },

    #[error("corrupt output: {0}")]
    Corrupt(String),
}

/// Retrieve the artifacts of a succeeded job, in backend order.
///
/// Either every artifact is returned or none is.
pub async fn collect<B: GenerationBackend>(
    backend: &B,
    job: &Job,
    delivery: ArtifactDelivery,
) -> Result<Vec<Artifact>, CollectionError> {
    if job.state() != JobState::Succeeded {
        return Err(CollectionError::NotSucceeded {
            job_id: job.id().to_string(),
            state: job.state(),
        });
    }

    let files = backend.outputs(job.id()).await.map_err(|e| match e {
        BackendError::Malformed(reason) => CollectionError::Corrupt(reason),
        other => CollectionError::Unavailable(other),
    })?;

    let artifacts: Vec<Artifact> = match delivery {
        ArtifactDelivery::Reference => files
            .iter()
            .map(|file| {
                Artifact::reference(kind_from_filename(&file.filename), backend.view_url(file))
            })
            .collect(),
        ArtifactDelivery::Inline => {
            let fetches: Vec<_> = files.iter().map(|file| fetch_inline(backend, file)).collect();
            try_join_all(fetches).await?
        }
    };

    tracing::info!(
        job_id = job.id(),
        artifacts = artifacts.len(),
        ?delivery,
        "Collected artifacts",
    );
    Ok(artifacts)
}

async fn fetch_inline<B: GenerationBackend>(
    backend: &B,
    file: &OutputFile,
) -> Result<Artifact, CollectionError> {
    let fetched = backend
        .fetch(file)
        .await
        .map_err(|source| CollectionError::PartialFetch {
            filename: file.filename.clone(),
            source,
        })?;

    if fetched.bytes.is_empty() {
        return Err(CollectionError::Corrupt(format!("{} is empty", file.filename)));
    }

    let kind = match fetched.content_type {
        Some(ct) if !ct.is_empty() && ct != FALLBACK_KIND => ct,
        _ => kind_from_filename(&file.filename).to_string(),
    };

    Ok(Artifact::inline(kind, STANDARD.encode(&fetched.bytes)))
}
