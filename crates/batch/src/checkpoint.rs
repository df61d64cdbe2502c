use anyhow::Result;
use async_trait::async_trait;
use ingest::RequestKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::state::BatchJob;

/// Durable progress of a run, enough to continue after a crash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Prompt version the pending requests were built with.
    pub prompt_version: Option<String>,
    /// The most recent job; may be final.
    pub job: Option<BatchJob>,
    /// Requests not yet confirmed loaded.
    pub pending_request_keys: BTreeSet<RequestKey>,
    /// Fingerprints already committed to the sink.
    pub loaded_fingerprints: BTreeSet<String>,
}

impl CheckpointState {
    pub fn job_id(&self) -> Option<&str> {
        self.job.as_ref().and_then(|j| j.job_id.as_deref())
    }

    /// The recorded job, if it still needs polling or collecting.
    pub fn in_flight(&self) -> Option<&BatchJob> {
        self.job.as_ref().filter(|j| !j.state.is_final())
    }

    pub fn is_settled(&self) -> bool {
        self.pending_request_keys.is_empty() && self.in_flight().is_none()
    }
}

/// Persists [`CheckpointState`] between process runs.
///
/// Every mutation is written through immediately; callers never batch them.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<CheckpointState>>;

    /// Replace the whole record.
    async fn save(&self, state: &CheckpointState) -> Result<()>;

    async fn mark_loaded(&self, content_hash: &str) -> Result<()>;

    /// Drop a request key from the pending set.
    async fn mark_resolved(&self, key: &RequestKey) -> Result<()>;

    /// Record the job and its current state.
    async fn mark_job_state(&self, job: &BatchJob) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::JobState;

    #[test]
    fn test_in_flight_ignores_final_jobs() {
        let mut state = CheckpointState::default();
        assert!(state.is_settled());

        let mut job = BatchJob::new(vec![RequestKey::new("t1", 0)]);
        job.mark_submitted("batch_9".into()).unwrap();
        state.job = Some(job);
        assert_eq!(state.job_id(), Some("batch_9"));
        assert!(state.in_flight().is_some());
        assert!(!state.is_settled());

        if let Some(job) = state.job.as_mut() {
            job.advance(JobState::Failed).unwrap();
        }
        assert!(state.in_flight().is_none());
        assert!(state.is_settled());
    }

    #[test]
    fn test_serializes_keys_as_strings() {
        let mut state = CheckpointState::default();
        state.pending_request_keys.insert(RequestKey::new("t1", 3));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["pending_request_keys"][0], "t1__3");
    }
}
