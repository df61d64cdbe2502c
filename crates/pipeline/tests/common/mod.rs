#![allow(dead_code)]

use anyhow::{Result, bail};
use async_trait::async_trait;
use batch::{
    BackendError, BatchConfig, BatchJob, CheckpointState, CheckpointStore, InferenceBackend, JobStatus, RawOutcome,
    RawResponse, RemoteState, RetryPolicy,
};
use extract::{ExtractionRequest, FeatureNameEntry, FewShotExample, Insight, Taxonomy};
use ingest::{ChunkerConfig, CrmContext, RequestKey, TranscriptRecord, TranscriptSource};
use pipeline::{Pipeline, PipelineSettings};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use store::{FeatureSink, InsightSink};

pub fn record(id: &str) -> TranscriptRecord {
    TranscriptRecord {
        transcript_id: id.to_string(),
        transcript_text: format!(
            "Rep: Thanks for joining today.\nProspect: We run {} on five different tools and nobody reads the emails.",
            id
        ),
        summary: None,
        crm: CrmContext {
            company_name: Some(format!("{} Corp", id)),
            region: Some("latam".into()),
            country: Some("Chile".into()),
            ..Default::default()
        },
    }
}

/// Two speaker turns that split into two chunks at a 100-token budget.
pub fn long_record(id: &str) -> TranscriptRecord {
    TranscriptRecord {
        transcript_text: format!(
            "Rep: {}\nProspect: {}",
            "we need better onboarding ".repeat(12).trim_end(),
            "our teams use too many apps ".repeat(9).trim_end()
        ),
        ..record(id)
    }
}

pub fn records(n: usize) -> Vec<TranscriptRecord> {
    (0..n).map(|i| record(&format!("t{:03}", i))).collect()
}

pub fn insight(insight_type: &str, subtype: &str, summary: &str) -> Value {
    json!({
        "insight_type": insight_type,
        "insight_subtype": subtype,
        "module": null,
        "summary": summary,
        "verbatim_quote": null,
        "confidence": 0.9,
        "competitor_name": null,
        "competitor_relationship": null,
        "feature_name": null,
        "gap_description": null,
        "gap_priority": null,
        "faq_topic": null
    })
}

pub fn body(insights: Vec<Value>) -> String {
    json!({ "insights": insights }).to_string()
}

/// One well-formed pain insight, unique per request.
pub fn default_body(key: &RequestKey) -> String {
    body(vec![insight(
        "pain",
        "fragmented_tools",
        &format!("Prospect {} juggles too many internal tools.", key),
    )])
}

pub fn settings(batch_dir: &Path) -> PipelineSettings {
    PipelineSettings {
        taxonomy: Taxonomy::builtin().unwrap(),
        few_shot: FewShotExample::builtin().unwrap(),
        refinements: None,
        prompt_version: "v2.0".into(),
        summary_language: "English".into(),
        model: "test-model".into(),
        chunker: ChunkerConfig::default(),
        batch: BatchConfig {
            poll_interval: Duration::from_millis(1),
            max_poll_duration: None,
            max_requests_per_batch: 2000,
        },
        retry: RetryPolicy::new(0, 1, 1),
        batch_dir: batch_dir.to_path_buf(),
        force: false,
    }
}

pub fn build_pipeline(store: &Arc<MemoryStore>, backend: Option<Arc<ScriptedBackend>>, settings: PipelineSettings) -> Pipeline {
    Pipeline::new(
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
        backend.map(|b| b as Arc<dyn InferenceBackend>),
        settings,
    )
}

/// Transcripts, insights, feature names and checkpoint held in memory.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<TranscriptRecord>>,
    insights: Mutex<Vec<Insight>>,
    features: Mutex<Vec<FeatureNameEntry>>,
    checkpoint: Mutex<Option<CheckpointState>>,
    broken_writes: Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn with_records(records: Vec<TranscriptRecord>) -> Arc<Self> {
        let store = Self::default();
        *store.records.lock().unwrap() = records;
        Arc::new(store)
    }

    pub fn insights(&self) -> Vec<Insight> {
        self.insights.lock().unwrap().clone()
    }

    pub fn features(&self) -> Vec<FeatureNameEntry> {
        self.features.lock().unwrap().clone()
    }

    pub fn checkpoint(&self) -> Option<CheckpointState> {
        self.checkpoint.lock().unwrap().clone()
    }

    pub fn set_checkpoint(&self, state: CheckpointState) {
        *self.checkpoint.lock().unwrap() = Some(state);
    }

    /// Insight writes for this transcript fail until `repair_writes`.
    pub fn break_writes(&self, transcript_id: &str) {
        self.broken_writes.lock().unwrap().insert(transcript_id.to_string());
    }

    pub fn repair_writes(&self) {
        self.broken_writes.lock().unwrap().clear();
    }
}

#[async_trait]
impl TranscriptSource for MemoryStore {
    async fn fetch_transcripts(&self, limit: Option<usize>) -> Result<Vec<TranscriptRecord>> {
        let records = self.records.lock().unwrap().clone();
        Ok(match limit {
            Some(n) => records.into_iter().take(n).collect(),
            None => records,
        })
    }

    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<TranscriptRecord>> {
        let wanted: HashSet<&String> = ids.iter().collect();
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| wanted.contains(&r.transcript_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InsightSink for MemoryStore {
    async fn insert_if_absent(&self, insight: &Insight) -> Result<bool> {
        if self.broken_writes.lock().unwrap().contains(&insight.transcript_id) {
            bail!("disk I/O error");
        }
        let mut insights = self.insights.lock().unwrap();
        if insights.iter().any(|i| i.content_hash == insight.content_hash) {
            return Ok(false);
        }
        insights.push(insight.clone());
        Ok(true)
    }

    async fn processed_transcripts(&self, prompt_version: &str) -> Result<HashSet<String>> {
        Ok(self
            .insights
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.prompt_version == prompt_version)
            .map(|i| i.transcript_id.clone())
            .collect())
    }

    async fn insight_count(&self) -> Result<usize> {
        Ok(self.insights.lock().unwrap().len())
    }
}

#[async_trait]
impl FeatureSink for MemoryStore {
    async fn load_features(&self) -> Result<Vec<FeatureNameEntry>> {
        Ok(self.features())
    }

    async fn append_feature(&self, entry: &FeatureNameEntry) -> Result<bool> {
        let mut features = self.features.lock().unwrap();
        if features.iter().any(|f| f.code == entry.code) {
            return Ok(false);
        }
        features.push(entry.clone());
        Ok(true)
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(&self) -> Result<Option<CheckpointState>> {
        Ok(self.checkpoint())
    }

    async fn save(&self, state: &CheckpointState) -> Result<()> {
        self.set_checkpoint(state.clone());
        Ok(())
    }

    async fn mark_loaded(&self, content_hash: &str) -> Result<()> {
        self.checkpoint
            .lock()
            .unwrap()
            .get_or_insert_with(CheckpointState::default)
            .loaded_fingerprints
            .insert(content_hash.to_string());
        Ok(())
    }

    async fn mark_resolved(&self, key: &RequestKey) -> Result<()> {
        if let Some(state) = self.checkpoint.lock().unwrap().as_mut() {
            state.pending_request_keys.remove(key);
        }
        Ok(())
    }

    async fn mark_job_state(&self, job: &BatchJob) -> Result<()> {
        self.checkpoint
            .lock()
            .unwrap()
            .get_or_insert_with(CheckpointState::default)
            .job = Some(job.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.checkpoint.lock().unwrap() = None;
        Ok(())
    }
}

/// Answers every request with a body derived from its key.
///
/// A job's per-request outcomes are fixed when it is submitted, so collecting
/// the same job twice returns the same results.
#[derive(Default)]
pub struct ScriptedBackend {
    bodies: Mutex<HashMap<RequestKey, String>>,
    failing: Mutex<HashSet<RequestKey>>,
    jobs: Mutex<HashMap<String, Vec<RawResponse>>>,
    submitted: Mutex<Vec<Vec<RequestKey>>>,
    dead: Mutex<HashSet<String>>,
    completes: AtomicUsize,
    polls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, key: RequestKey, body: String) {
        self.bodies.lock().unwrap().insert(key, body);
    }

    pub fn fail(&self, keys: impl IntoIterator<Item = RequestKey>) {
        self.failing.lock().unwrap().extend(keys);
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Register a job as if an earlier process had submitted it.
    pub fn existing_job(&self, job_id: &str, keys: &[RequestKey]) {
        let results = keys
            .iter()
            .map(|key| RawResponse {
                key: key.clone(),
                outcome: RawOutcome::Body(self.body_for(key)),
            })
            .collect();
        self.jobs.lock().unwrap().insert(job_id.to_string(), results);
    }

    /// The backend reports this job as failed.
    pub fn kill(&self, job_id: &str) {
        self.dead.lock().unwrap().insert(job_id.to_string());
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    /// Keys of every submitted job, in submission order.
    pub fn submitted(&self) -> Vec<Vec<RequestKey>> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn complete_count(&self) -> usize {
        self.completes.load(Ordering::SeqCst)
    }

    fn body_for(&self, key: &RequestKey) -> String {
        self.bodies
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_else(|| default_body(key))
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn model(&self) -> &str {
        "test-model"
    }

    async fn complete(&self, request: &ExtractionRequest) -> Result<String, BackendError> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        Ok(self.body_for(&request.key))
    }

    async fn submit_batch(&self, requests: &[ExtractionRequest]) -> Result<String, BackendError> {
        let keys: Vec<RequestKey> = requests.iter().map(|r| r.key.clone()).collect();
        let failing = self.failing.lock().unwrap().clone();
        let results = keys
            .iter()
            .map(|key| RawResponse {
                key: key.clone(),
                outcome: if failing.contains(key) {
                    RawOutcome::Error("server_error".into())
                } else {
                    RawOutcome::Body(self.body_for(key))
                },
            })
            .collect();

        let mut submitted = self.submitted.lock().unwrap();
        let job_id = format!("batch_{}", submitted.len());
        submitted.push(keys);
        self.jobs.lock().unwrap().insert(job_id.clone(), results);
        Ok(job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobStatus, BackendError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.dead.lock().unwrap().contains(job_id) {
            return Ok(JobStatus {
                remote: RemoteState::Failed,
                total: 0,
                completed: 0,
                failed: 0,
            });
        }
        let jobs = self.jobs.lock().unwrap();
        let results = jobs
            .get(job_id)
            .ok_or_else(|| BackendError::InvalidResponse(format!("unknown job {}", job_id)))?;
        let failed = results
            .iter()
            .filter(|r| matches!(r.outcome, RawOutcome::Error(_)))
            .count();
        Ok(JobStatus {
            remote: RemoteState::Completed,
            total: results.len(),
            completed: results.len() - failed,
            failed,
        })
    }

    async fn fetch_results(&self, job_id: &str) -> Result<Vec<RawResponse>, BackendError> {
        self.jobs
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .ok_or_else(|| BackendError::InvalidResponse(format!("unknown job {}", job_id)))
    }
}
