//! In-memory doubles for the backend and checkpoint seams.

use anyhow::Result;
use async_trait::async_trait;
use extract::ExtractionRequest;
use ingest::RequestKey;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::backend::{BackendError, InferenceBackend, JobStatus, RawOutcome, RawResponse, RemoteState};
use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::state::{BatchJob, JobState};

pub fn request(transcript_id: &str, chunk_index: u32) -> ExtractionRequest {
    ExtractionRequest {
        key: RequestKey::new(transcript_id, chunk_index),
        system_prompt: "system".into(),
        user_prompt: format!("chunk {} of {}", chunk_index, transcript_id),
    }
}

pub struct ScriptedBackend {
    polls_before_done: usize,
    remote_end: RemoteState,
    fail_keys: Vec<RequestKey>,
    drop_keys: Vec<RequestKey>,
    submit_error: Option<BackendError>,
    complete_errors: Mutex<VecDeque<BackendError>>,
    submitted: Mutex<Vec<RequestKey>>,
    submits: AtomicUsize,
    polls: AtomicUsize,
    completes: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            polls_before_done: 0,
            remote_end: RemoteState::Completed,
            fail_keys: Vec::new(),
            drop_keys: Vec::new(),
            submit_error: None,
            complete_errors: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            submits: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            completes: AtomicUsize::new(0),
        }
    }

    pub fn polls_before_done(mut self, n: usize) -> Self {
        self.polls_before_done = n;
        self
    }

    pub fn remote_end(mut self, state: RemoteState) -> Self {
        self.remote_end = state;
        self
    }

    pub fn fail_keys(mut self, keys: Vec<RequestKey>) -> Self {
        self.fail_keys = keys;
        self
    }

    pub fn drop_keys(mut self, keys: Vec<RequestKey>) -> Self {
        self.drop_keys = keys;
        self
    }

    pub fn submit_error(mut self, error: BackendError) -> Self {
        self.submit_error = Some(error);
        self
    }

    pub fn complete_errors(self, errors: Vec<BackendError>) -> Self {
        *self.complete_errors.lock().unwrap() = errors.into();
        self
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn complete_count(&self) -> usize {
        self.completes.load(Ordering::SeqCst)
    }
}

fn body_for(key: &RequestKey) -> String {
    format!(r#"{{"insights": [], "key": "{}"}}"#, key)
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ExtractionRequest) -> Result<String, BackendError> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.complete_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(body_for(&request.key))
    }

    async fn submit_batch(&self, requests: &[ExtractionRequest]) -> Result<String, BackendError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.submit_error {
            return Err(error.clone());
        }
        *self.submitted.lock().unwrap() = requests.iter().map(|r| r.key.clone()).collect();
        Ok(format!("batch_{}", n))
    }

    async fn poll(&self, _job_id: &str) -> Result<JobStatus, BackendError> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.submitted.lock().unwrap().len();
        let remote = if n > self.polls_before_done {
            self.remote_end
        } else {
            RemoteState::InProgress
        };
        Ok(JobStatus {
            remote,
            total,
            completed: if remote.is_terminal() { total } else { 0 },
            failed: 0,
        })
    }

    async fn fetch_results(&self, _job_id: &str) -> Result<Vec<RawResponse>, BackendError> {
        let submitted = self.submitted.lock().unwrap().clone();
        Ok(submitted
            .into_iter()
            .filter(|key| !self.drop_keys.contains(key))
            .map(|key| {
                let outcome = if self.fail_keys.contains(&key) {
                    RawOutcome::Error("server_error".into())
                } else {
                    RawOutcome::Body(body_for(&key))
                };
                RawResponse { key, outcome }
            })
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryCheckpoint {
    state: Mutex<Option<CheckpointState>>,
    job_states: Mutex<Vec<JobState>>,
}

impl MemoryCheckpoint {
    /// Every job state written, in order.
    pub fn job_states(&self) -> Vec<JobState> {
        self.job_states.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoint {
    async fn load(&self) -> Result<Option<CheckpointState>> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn save(&self, state: &CheckpointState) -> Result<()> {
        *self.state.lock().unwrap() = Some(state.clone());
        Ok(())
    }

    async fn mark_loaded(&self, content_hash: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .get_or_insert_with(CheckpointState::default)
            .loaded_fingerprints
            .insert(content_hash.to_string());
        Ok(())
    }

    async fn mark_resolved(&self, key: &RequestKey) -> Result<()> {
        if let Some(state) = self.state.lock().unwrap().as_mut() {
            state.pending_request_keys.remove(key);
        }
        Ok(())
    }

    async fn mark_job_state(&self, job: &BatchJob) -> Result<()> {
        self.job_states.lock().unwrap().push(job.state);
        self.state
            .lock()
            .unwrap()
            .get_or_insert_with(CheckpointState::default)
            .job = Some(job.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.state.lock().unwrap() = None;
        Ok(())
    }
}
