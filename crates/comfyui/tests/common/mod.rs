//! In-memory [`GenerationBackend`] for exercising the bridge without ComfyUI.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use comfyrun_comfyui::backend::{BackendError, BackendStatus, FetchedFile, GenerationBackend};
use comfyrun_comfyui::history::OutputFile;
use comfyrun_core::types::JobId;
use serde_json::Value;

/// Scripted backend.
///
/// Each job walks through the status script independently; the last
/// entry repeats forever. Job ids are the request tokens, as with ComfyUI.
pub struct MockBackend {
    state: Mutex<MockState>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
}

struct MockState {
    statuses: Vec<Result<BackendStatus, BackendError>>,
    outputs: Vec<(OutputFile, Result<FetchedFile, BackendError>)>,
    outputs_error: Option<BackendError>,
    submit_failures: Vec<BackendError>,
    land_failed_submissions: bool,
    hanging_submits: usize,
    hanging_fetches: bool,
    hanging_cancels: bool,
    jobs: HashSet<JobId>,
    positions: HashMap<JobId, usize>,
    cancelled: Vec<JobId>,
    healthy: bool,
}

pub fn output_file(filename: &str) -> OutputFile {
    OutputFile {
        filename: filename.to_string(),
        subfolder: String::new(),
        folder_type: "output".to_string(),
    }
}

impl MockBackend {
    /// A backend whose jobs succeed on the first status query with no outputs.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                statuses: vec![Ok(BackendStatus::Succeeded)],
                outputs: Vec::new(),
                outputs_error: None,
                submit_failures: Vec::new(),
                land_failed_submissions: false,
                hanging_submits: 0,
                hanging_fetches: false,
                hanging_cancels: false,
                jobs: HashSet::new(),
                positions: HashMap::new(),
                cancelled: Vec::new(),
                healthy: true,
            }),
            submit_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_statuses(mut self, statuses: Vec<Result<BackendStatus, BackendError>>) -> Self {
        assert!(!statuses.is_empty());
        self.state.get_mut().unwrap().statuses = statuses;
        self
    }

    pub fn with_output(mut self, filename: &str, content_type: Option<&str>, bytes: &[u8]) -> Self {
        let fetched = FetchedFile {
            bytes: bytes.to_vec(),
            content_type: content_type.map(str::to_string),
        };
        self.state
            .get_mut()
            .unwrap()
            .outputs
            .push((output_file(filename), Ok(fetched)));
        self
    }

    pub fn with_failing_output(mut self, filename: &str, error: BackendError) -> Self {
        self.state
            .get_mut()
            .unwrap()
            .outputs
            .push((output_file(filename), Err(error)));
        self
    }

    pub fn with_outputs_error(mut self, error: BackendError) -> Self {
        self.state.get_mut().unwrap().outputs_error = Some(error);
        self
    }

    /// Fail the next submissions, in order, with these errors.
    pub fn with_submit_failures(mut self, failures: Vec<BackendError>) -> Self {
        self.state.get_mut().unwrap().submit_failures = failures;
        self
    }

    /// Failed submissions still create the job, as when the reply is lost.
    pub fn landing_failed_submissions(mut self) -> Self {
        self.state.get_mut().unwrap().land_failed_submissions = true;
        self
    }

    /// The next `count` submissions never resolve.
    pub fn with_hanging_submits(mut self, count: usize) -> Self {
        self.state.get_mut().unwrap().hanging_submits = count;
        self
    }

    /// Output downloads never resolve.
    pub fn with_hanging_fetches(mut self) -> Self {
        self.state.get_mut().unwrap().hanging_fetches = true;
        self
    }

    /// Cancel requests are recorded but never resolve.
    pub fn with_hanging_cancels(mut self) -> Self {
        self.state.get_mut().unwrap().hanging_cancels = true;
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.state.get_mut().unwrap().healthy = false;
        self
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.submit_calls() + self.status_calls() + self.fetch_calls() + self.cancel_calls()
    }

    pub fn cancelled_jobs(&self) -> Vec<JobId> {
        self.state.lock().unwrap().cancelled.clone()
    }
}

impl GenerationBackend for MockBackend {
    async fn submit(&self, _workflow: &Value, request_token: &str) -> Result<JobId, BackendError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let hang = {
            let mut state = self.state.lock().unwrap();
            let hang = state.hanging_submits > 0;
            if hang {
                state.hanging_submits -= 1;
            }
            hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        if !state.submit_failures.is_empty() {
            let error = state.submit_failures.remove(0);
            if state.land_failed_submissions {
                state.jobs.insert(request_token.to_string());
            }
            return Err(error);
        }

        state.jobs.insert(request_token.to_string());
        Ok(request_token.to_string())
    }

    async fn status(&self, job_id: &str) -> Result<BackendStatus, BackendError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();

        if !state.jobs.contains(job_id) {
            return Ok(BackendStatus::Unknown);
        }

        let last = state.statuses.len() - 1;
        let position = state.positions.entry(job_id.to_string()).or_insert(0);
        let index = (*position).min(last);
        *position += 1;
        state.statuses[index].clone()
    }

    async fn outputs(&self, _job_id: &str) -> Result<Vec<OutputFile>, BackendError> {
        let state = self.state.lock().unwrap();
        if let Some(error) = &state.outputs_error {
            return Err(error.clone());
        }
        Ok(state.outputs.iter().map(|(file, _)| file.clone()).collect())
    }

    async fn fetch(&self, file: &OutputFile) -> Result<FetchedFile, BackendError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let hang = self.state.lock().unwrap().hanging_fetches;
        if hang {
            std::future::pending::<()>().await;
        }

        let state = self.state.lock().unwrap();
        state
            .outputs
            .iter()
            .find(|(f, _)| f == file)
            .map(|(_, fetched)| fetched.clone())
            .unwrap_or_else(|| Err(BackendError::Rejected("HTTP 404".to_string())))
    }

    fn view_url(&self, file: &OutputFile) -> String {
        format!("mock://view/{}", file.filename)
    }

    async fn cancel(&self, job_id: &str) -> Result<(), BackendError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let hang = {
            let mut state = self.state.lock().unwrap();
            state.cancelled.push(job_id.to_string());
            state.hanging_cancels
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn health(&self) -> Result<(), BackendError> {
        if self.state.lock().unwrap().healthy {
            Ok(())
        } else {
            Err(BackendError::Unreachable("connection refused".to_string()))
        }
    }
}
