use extract::ExtractionRequest;
use ingest::RequestKey;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::backend::{BackendError, InferenceBackend, JobStatus, RawOutcome, RawResponse, RemoteState};
use crate::checkpoint::CheckpointStore;
use crate::retry::RetryPolicy;
use crate::state::{BatchJob, JobState, StateError};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch job {job_id} ended as {remote} on the backend")]
    JobFailed { job_id: String, remote: RemoteState },

    #[error("batch job {job_id} still running after {waited:?}; re-run with --resume to keep waiting")]
    PollTimeout { job_id: String, waited: Duration },

    #[error("request set of {count} exceeds the per-job limit of {limit}")]
    TooLarge { count: usize, limit: usize },

    #[error("batch job has no backend id")]
    MissingJobId,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("checkpoint write failed: {0:#}")]
    Checkpoint(anyhow::Error),
}

impl BatchError {
    /// Worth retrying later with `--resume`; nothing was lost.
    pub fn is_resumable(&self) -> bool {
        match self {
            BatchError::PollTimeout { .. } => true,
            BatchError::Backend(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub poll_interval: Duration,
    /// Surface a job still running after this long instead of waiting forever.
    pub max_poll_duration: Option<Duration>,
    pub max_requests_per_batch: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            max_poll_duration: Some(Duration::from_secs(26 * 3600)),
            max_requests_per_batch: 2000,
        }
    }
}

/// A terminal job and what it returned.
#[derive(Debug)]
pub struct BatchOutcome {
    pub job: BatchJob,
    /// Successful bodies, one per key, in job order.
    pub responses: Vec<RawResponse>,
    /// Keys that errored or never came back.
    pub failed_keys: Vec<RequestKey>,
}

/// Drives one job through submit, poll and collect, writing the checkpoint
/// after every state transition.
pub struct BatchOrchestrator {
    backend: Arc<dyn InferenceBackend>,
    checkpoint: Arc<dyn CheckpointStore>,
    config: BatchConfig,
    retry: RetryPolicy,
}

impl BatchOrchestrator {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        checkpoint: Arc<dyn CheckpointStore>,
        config: BatchConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            checkpoint,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    async fn persist(&self, job: &BatchJob) -> Result<(), BatchError> {
        self.checkpoint
            .mark_job_state(job)
            .await
            .map_err(BatchError::Checkpoint)
    }

    /// Transmit the whole request set as one job.
    ///
    /// Transient failures are retried as a whole. If the retry budget runs
    /// out the job stays in `Building` so a resume resubmits it; a fatal
    /// rejection moves it to `Failed`.
    pub async fn submit(&self, requests: &[ExtractionRequest]) -> Result<BatchJob, BatchError> {
        if requests.len() > self.config.max_requests_per_batch {
            return Err(BatchError::TooLarge {
                count: requests.len(),
                limit: self.config.max_requests_per_batch,
            });
        }

        let mut job = BatchJob::new(requests.iter().map(|r| r.key.clone()).collect());
        self.persist(&job).await?;

        let submitted = self
            .retry
            .retry("submit_batch", || self.backend.submit_batch(requests))
            .await;

        match submitted {
            Ok(job_id) => {
                job.mark_submitted(job_id)?;
                self.persist(&job).await?;
                info!(
                    job_id = job.job_id.as_deref().unwrap_or("-"),
                    requests = job.request_count,
                    "Submitted batch job"
                );
                Ok(job)
            }
            Err(e) if e.is_transient() => Err(e.into()),
            Err(e) => {
                job.advance(JobState::Failed)?;
                self.persist(&job).await?;
                Err(e.into())
            }
        }
    }

    /// Check status at a fixed interval until the backend reports a terminal
    /// state or the configured ceiling passes.
    pub async fn poll_until_terminal(&self, job: &mut BatchJob) -> Result<JobStatus, BatchError> {
        let job_id = job.job_id.clone().ok_or(BatchError::MissingJobId)?;
        let started = Instant::now();

        loop {
            let status = self
                .retry
                .retry("poll_batch", || self.backend.poll(&job_id))
                .await?;
            job.record_poll(&status)?;
            self.persist(job).await?;

            info!(
                job_id = %job_id,
                remote = %status.remote,
                completed = status.completed,
                failed = status.failed,
                total = status.total,
                "Polled batch job"
            );

            if status.remote.is_terminal() {
                return Ok(status);
            }

            if let Some(ceiling) = self.config.max_poll_duration {
                let waited = started.elapsed();
                if waited >= ceiling {
                    warn!(job_id = %job_id, waited_secs = waited.as_secs(), "Batch job exceeded poll ceiling");
                    return Err(BatchError::PollTimeout { job_id, waited });
                }
            }

            sleep(self.config.poll_interval).await;
        }
    }

    /// Retrieve per-request results of a terminal job and settle its state.
    pub async fn collect(&self, job: &mut BatchJob, status: &JobStatus) -> Result<BatchOutcome, BatchError> {
        let job_id = job.job_id.clone().ok_or(BatchError::MissingJobId)?;

        if status.remote == RemoteState::Failed {
            if !job.state.is_final() {
                job.advance(JobState::Failed)?;
                self.persist(job).await?;
            }
            return Err(BatchError::JobFailed {
                job_id,
                remote: status.remote,
            });
        }

        let results = self
            .retry
            .retry("fetch_results", || self.backend.fetch_results(&job_id))
            .await?;

        let expected: HashSet<&RequestKey> = job.request_keys.iter().collect();
        let mut by_key: HashMap<RequestKey, RawOutcome> = HashMap::new();
        for result in results {
            if !expected.contains(&result.key) {
                warn!(job_id = %job_id, key = %result.key, "Ignoring result for a key not in this job");
                continue;
            }
            by_key.entry(result.key).or_insert(result.outcome);
        }

        let mut responses = Vec::new();
        let mut failed_keys = Vec::new();
        for key in &job.request_keys {
            match by_key.remove(key) {
                Some(RawOutcome::Body(body)) => responses.push(RawResponse {
                    key: key.clone(),
                    outcome: RawOutcome::Body(body),
                }),
                Some(RawOutcome::Error(error)) => {
                    warn!(job_id = %job_id, key = %key, error = %error, "Request failed in batch");
                    failed_keys.push(key.clone());
                }
                None => {
                    warn!(job_id = %job_id, key = %key, "No result returned for request");
                    failed_keys.push(key.clone());
                }
            }
        }

        if !job.state.is_final() {
            job.completed_count = responses.len();
            job.failed_count = failed_keys.len();
            let next = if failed_keys.is_empty() && status.remote == RemoteState::Completed {
                JobState::Completed
            } else {
                JobState::PartiallyFailed
            };
            job.advance(next)?;
            self.persist(job).await?;
        }

        info!(
            job_id = %job_id,
            state = %job.state,
            succeeded = responses.len(),
            failed = failed_keys.len(),
            "Collected batch results"
        );

        Ok(BatchOutcome {
            job: job.clone(),
            responses,
            failed_keys,
        })
    }

    pub async fn run(&self, requests: &[ExtractionRequest]) -> Result<BatchOutcome, BatchError> {
        let mut job = self.submit(requests).await?;
        let status = self.poll_until_terminal(&mut job).await?;
        self.collect(&mut job, &status).await
    }

    /// Continue a checkpointed job: re-poll it if still open, or re-collect
    /// its results if it already settled. Never resubmits.
    pub async fn resume(&self, mut job: BatchJob) -> Result<BatchOutcome, BatchError> {
        let job_id = job.job_id.clone().ok_or(BatchError::MissingJobId)?;
        info!(job_id = %job_id, state = %job.state, "Resuming batch job");

        let status = match job.state {
            JobState::Failed => {
                return Err(BatchError::JobFailed {
                    job_id,
                    remote: RemoteState::Failed,
                });
            }
            JobState::Completed | JobState::PartiallyFailed => {
                self.retry
                    .retry("poll_batch", || self.backend.poll(&job_id))
                    .await?
            }
            JobState::Building | JobState::Submitted | JobState::Polling => {
                self.poll_until_terminal(&mut job).await?
            }
        };
        self.collect(&mut job, &status).await
    }
}
