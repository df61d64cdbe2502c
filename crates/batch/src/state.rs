use chrono::{DateTime, Utc};
use ingest::RequestKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

use crate::backend::JobStatus;

/// Lifecycle of one asynchronous batch job.
///
/// ```text
/// Building -> Submitted -> Polling -> {Completed | PartiallyFailed | Failed}
///                            ^   |
///                            +---+
/// ```
/// Any non-final state may also drop straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Building,
    Submitted,
    Polling,
    Completed,
    PartiallyFailed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Building => "building",
            JobState::Submitted => "submitted",
            JobState::Polling => "polling",
            JobState::Completed => "completed",
            JobState::PartiallyFailed => "partially_failed",
            JobState::Failed => "failed",
        }
    }

    /// No further transitions. Failed keys of a partially failed job are
    /// resubmitted as a new job, never by reviving this one.
    pub fn is_final(&self) -> bool {
        matches!(self, JobState::Completed | JobState::PartiallyFailed | JobState::Failed)
    }

    pub fn can_advance_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (*self, next),
            (Building, Submitted)
                | (Submitted, Polling)
                | (Polling, Polling)
                | (Polling, Completed)
                | (Polling, PartiallyFailed)
                | (Building | Submitted | Polling, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use JobState::*;
        [Building, Submitted, Polling, Completed, PartiallyFailed, Failed]
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state '{}'", s))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("illegal job transition {from} -> {to}")]
pub struct StateError {
    pub from: JobState,
    pub to: JobState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    /// Assigned by the backend on submission.
    pub job_id: Option<String>,
    pub state: JobState,
    pub request_keys: Vec<RequestKey>,
    pub request_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    pub fn new(request_keys: Vec<RequestKey>) -> Self {
        Self {
            job_id: None,
            state: JobState::Building,
            request_count: request_keys.len(),
            request_keys,
            completed_count: 0,
            failed_count: 0,
            created_at: Utc::now(),
            last_polled_at: None,
        }
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), StateError> {
        if !self.state.can_advance_to(next) {
            return Err(StateError {
                from: self.state,
                to: next,
            });
        }
        if self.state != next {
            info!(
                job_id = self.job_id.as_deref().unwrap_or("-"),
                from = %self.state,
                to = %next,
                "Batch job state transition"
            );
        }
        self.state = next;
        Ok(())
    }

    pub fn mark_submitted(&mut self, job_id: String) -> Result<(), StateError> {
        self.advance(JobState::Submitted)?;
        self.job_id = Some(job_id);
        Ok(())
    }

    /// Record one status check. Only moves the job into (or keeps it in)
    /// `Polling`; terminal states are decided once results are collected.
    pub fn record_poll(&mut self, status: &JobStatus) -> Result<(), StateError> {
        self.advance(JobState::Polling)?;
        self.completed_count = status.completed;
        self.failed_count = status.failed;
        self.last_polled_at = Some(Utc::now());
        Ok(())
    }
}
