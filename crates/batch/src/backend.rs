use async_trait::async_trait;
use extract::ExtractionRequest;
use ingest::RequestKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    /// Network trouble, timeouts, rate limits, 5xx.
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend rejected credentials ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    /// The request set itself was refused.
    #[error("backend rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 | 500..=599 => BackendError::Transient(format!("HTTP {}: {}", status, body)),
            401 | 403 => BackendError::Unauthorized { status, body },
            _ => BackendError::Rejected { status, body },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// What the backend returned for one request of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutcome {
    /// The model's message content, not yet validated.
    Body(String),
    /// A per-request error reported by the backend.
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub key: RequestKey,
    pub outcome: RawOutcome,
}

/// Remote job status, collapsed to what the state machine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    InProgress,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl RemoteState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RemoteState::InProgress)
    }
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteState::InProgress => "in_progress",
            RemoteState::Completed => "completed",
            RemoteState::Failed => "failed",
            RemoteState::Expired => "expired",
            RemoteState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatus {
    pub remote: RemoteState,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Synchronous single-request calls plus the asynchronous batch API.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn model(&self) -> &str;

    /// One request, answered directly. Returns the message content.
    async fn complete(&self, request: &ExtractionRequest) -> Result<String, BackendError>;

    /// Submit the whole request set as one job. Returns the job id.
    async fn submit_batch(&self, requests: &[ExtractionRequest]) -> Result<String, BackendError>;

    async fn poll(&self, job_id: &str) -> Result<JobStatus, BackendError>;

    /// Per-request results of a terminal job.
    async fn fetch_results(&self, job_id: &str) -> Result<Vec<RawResponse>, BackendError>;
}
