use anyhow::Context;
use batch::{
    BackendError, BatchConfig, BatchError, BatchOrchestrator, BatchOutcome, CheckpointState, CheckpointStore,
    DirectRunner, InferenceBackend, JobState, JobStatus, RawOutcome, RawResponse, RetryPolicy, batch_jsonl,
};
use chrono::Utc;
use extract::{
    ExtractionRequest, FeatureRegistry, FewShotExample, PromptBuilder, PromptVersion, Provenance, Refinements,
    ResponseNormalizer, Taxonomy,
};
use ingest::{Chunker, ChunkerConfig, RequestKey, TranscriptRecord, TranscriptSource, TranscriptUnit};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use store::{FeatureSink, InsightSink, Loader};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::metrics::{RunReport, TimedOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// First N transcripts through the synchronous path, unfiltered.
    Sample(usize),
    /// Build the request set and write it to disk; no network calls.
    DryRun,
    /// Continue from the checkpoint.
    Resume,
    /// Every unprocessed transcript through the batch path.
    Full,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Sample(_) => "sample",
            RunMode::DryRun => "dry-run",
            RunMode::Resume => "resume",
            RunMode::Full => "full",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("batch job {job_id} is still in flight; run with --resume to collect it")]
    JobInFlight { job_id: String },

    #[error("checkpoint belongs to prompt version {checkpoint}, but this run uses {current}")]
    PromptVersionMismatch { checkpoint: String, current: String },

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// A later `--resume` can pick up where this left off.
    pub fn is_resumable(&self) -> bool {
        match self {
            // pending keys survive a failed job and are resubmitted on resume
            PipelineError::Batch(BatchError::JobFailed { .. }) => true,
            PipelineError::Batch(e) => e.is_resumable(),
            _ => false,
        }
    }
}

/// Everything a run needs besides its stores and backend.
pub struct PipelineSettings {
    pub taxonomy: Taxonomy,
    pub few_shot: Vec<FewShotExample>,
    pub refinements: Option<Refinements>,
    pub prompt_version: String,
    pub summary_language: String,
    pub model: String,
    pub chunker: ChunkerConfig,
    pub batch: BatchConfig,
    pub retry: RetryPolicy,
    pub batch_dir: PathBuf,
    /// Reprocess transcripts that already have rows under this version.
    pub force: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let taxonomy = match &config.paths.taxonomy {
            Some(path) => Taxonomy::load(path)?,
            None => Taxonomy::builtin()?,
        };
        let few_shot = match &config.paths.few_shot {
            Some(path) => FewShotExample::load(path)?,
            None => FewShotExample::builtin()?,
        };

        Ok(Self {
            taxonomy,
            few_shot,
            refinements: Refinements::load(&config.paths.refinements)?,
            prompt_version: config.prompt.version.clone(),
            summary_language: config.prompt.summary_language.clone(),
            model: config.openai.model.clone(),
            chunker: config.chunker_config(),
            batch: config.batch_config(),
            retry: config.retry_policy(),
            batch_dir: config.paths.batch_dir.clone(),
            force: false,
        })
    }
}

/// Per-run snapshot: taxonomy with discovered features merged in, and the
/// prompt and parser built from it.
struct RunContext {
    builder: PromptBuilder,
    normalizer: ResponseNormalizer,
    prompt_version: String,
}

/// Where parsed insights go and whether progress is checkpointed.
struct Delivery<'a> {
    loader: Loader,
    batch_id: Option<&'a str>,
    track: bool,
}

/// Checkpoint and, when a job is in flight, its live progress.
#[derive(Debug)]
pub struct StatusReport {
    pub checkpoint: Option<CheckpointState>,
    pub live: Option<JobStatus>,
    pub insight_count: usize,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Insights stored:  {}", self.insight_count)?;
        let Some(state) = &self.checkpoint else {
            return write!(f, "Checkpoint:       none");
        };
        writeln!(
            f,
            "Prompt version:   {}",
            state.prompt_version.as_deref().unwrap_or("-")
        )?;
        match &state.job {
            Some(job) => {
                writeln!(f, "Job:              {}", job.job_id.as_deref().unwrap_or("(not submitted)"))?;
                writeln!(f, "  state:          {}", job.state)?;
                writeln!(f, "  requests:       {}", job.request_count)?;
                writeln!(f, "  created:        {}", job.created_at.to_rfc3339())?;
                if let Some(polled) = job.last_polled_at {
                    writeln!(f, "  last polled:    {}", polled.to_rfc3339())?;
                }
            }
            None => writeln!(f, "Job:              none")?,
        }
        if let Some(live) = &self.live {
            writeln!(
                f,
                "  live:           {} ({}/{} done, {} failed)",
                live.remote, live.completed, live.total, live.failed
            )?;
        }
        writeln!(f, "Pending requests: {}", state.pending_request_keys.len())?;
        write!(f, "Loaded insights:  {}", state.loaded_fingerprints.len())
    }
}

/// Extract, chunk, build, submit, poll, parse and load.
pub struct Pipeline {
    source: Arc<dyn TranscriptSource>,
    sink: Arc<dyn InsightSink>,
    features: Arc<dyn FeatureSink>,
    checkpoint: Arc<dyn CheckpointStore>,
    backend: Option<Arc<dyn InferenceBackend>>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn TranscriptSource>,
        sink: Arc<dyn InsightSink>,
        features: Arc<dyn FeatureSink>,
        checkpoint: Arc<dyn CheckpointStore>,
        backend: Option<Arc<dyn InferenceBackend>>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            source,
            sink,
            features,
            checkpoint,
            backend,
            settings,
        }
    }

    pub async fn run(&self, mode: RunMode) -> Result<RunReport, PipelineError> {
        let timer = TimedOperation::start();
        let ctx = self.context().await?;
        let mut report = RunReport::new(mode.as_str(), &ctx.prompt_version);
        info!(mode = mode.as_str(), prompt_version = %ctx.prompt_version, model = %self.settings.model, "Starting run");

        let result = match mode {
            RunMode::Sample(n) => self.run_sample(&ctx, n, &mut report).await,
            RunMode::DryRun => self.run_dry(&ctx, &mut report).await,
            RunMode::Resume => self.run_resume(&ctx, &mut report).await,
            RunMode::Full => self.run_full(&ctx, &mut report).await,
        };

        if !matches!(mode, RunMode::Sample(_) | RunMode::DryRun) {
            if let Ok(Some(state)) = self.checkpoint.load().await {
                report.pending_after = state.pending_request_keys.len();
            }
        }
        report.elapsed_ms = timer.elapsed_ms();
        report.log_summary();
        result.map(|_| report)
    }

    pub async fn status(&self) -> Result<StatusReport, PipelineError> {
        let checkpoint = self.checkpoint.load().await?;
        let live = match (checkpoint.as_ref().and_then(|s| s.in_flight()), &self.backend) {
            (Some(job), Some(backend)) => match &job.job_id {
                Some(job_id) => Some(backend.poll(job_id).await?),
                None => None,
            },
            _ => None,
        };
        Ok(StatusReport {
            checkpoint,
            live,
            insight_count: self.sink.insight_count().await?,
        })
    }

    /// Forget the checkpoint, including any pending requests.
    pub async fn reset(&self) -> Result<(), PipelineError> {
        if let Some(state) = self.checkpoint.load().await? {
            if let Some(job_id) = state.in_flight().and_then(|j| j.job_id.as_deref()) {
                warn!(job_id = %job_id, "Clearing checkpoint while a job is in flight; its results will not be collected");
            }
            info!(
                pending = state.pending_request_keys.len(),
                loaded = state.loaded_fingerprints.len(),
                "Clearing checkpoint"
            );
        }
        self.checkpoint.clear().await?;
        Ok(())
    }

    fn backend(&self) -> Result<Arc<dyn InferenceBackend>, PipelineError> {
        self.backend
            .clone()
            .ok_or_else(|| PipelineError::Config("an inference backend is required (set OPENAI_API_KEY)".into()))
    }

    async fn context(&self) -> Result<RunContext, PipelineError> {
        let discovered = self
            .features
            .load_features()
            .await?
            .into_iter()
            .filter(|f| !f.is_seed);
        let taxonomy = Arc::new(self.settings.taxonomy.with_features(discovered));
        let registry = Arc::new(FeatureRegistry::from_taxonomy(&taxonomy));

        let refinements = self.settings.refinements.as_ref();
        let version = PromptVersion::resolve(&self.settings.prompt_version, refinements)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        let builder = PromptBuilder::new(
            &taxonomy,
            refinements,
            &self.settings.few_shot,
            &self.settings.summary_language,
        )?;

        Ok(RunContext {
            builder,
            normalizer: ResponseNormalizer::new(taxonomy, registry),
            prompt_version: version.to_string(),
        })
    }

    fn chunk(&self, records: &[TranscriptRecord], report: &mut RunReport) -> Vec<TranscriptUnit> {
        let chunker = Chunker::new(self.settings.chunker);
        let (units, rejected) = ingest::chunk_records(&chunker, records);
        report.transcripts += records
            .iter()
            .map(|r| r.transcript_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        report.rejected_transcripts += rejected.len();
        units
    }

    /// Unprocessed transcripts, chunked.
    async fn select_units(
        &self,
        ctx: &RunContext,
        limit: Option<usize>,
        filter: bool,
        report: &mut RunReport,
    ) -> Result<Vec<TranscriptUnit>, PipelineError> {
        let mut records = self.source.fetch_transcripts(limit).await?;
        info!(count = records.len(), "Fetched transcripts");

        if filter && !self.settings.force {
            let processed = self.sink.processed_transcripts(&ctx.prompt_version).await?;
            let before = records.len();
            records.retain(|r| !processed.contains(&r.transcript_id));
            info!(
                before,
                after = records.len(),
                prompt_version = %ctx.prompt_version,
                "Filtered already processed transcripts"
            );
        }

        let units = self.chunk(&records, report);
        info!(chunks = units.len(), "Chunked transcripts");
        Ok(units)
    }

    async fn run_sample(&self, ctx: &RunContext, n: usize, report: &mut RunReport) -> Result<(), PipelineError> {
        let backend = self.backend()?;
        let units = self.select_units(ctx, Some(n), false, report).await?;
        report.requests = units.len();

        let runner = DirectRunner::new(backend, self.settings.retry.clone());
        let delivery = Delivery {
            loader: Loader::new(self.sink.clone(), None),
            batch_id: None,
            track: false,
        };

        for (i, unit) in units.iter().enumerate() {
            info!(
                transcript_id = %unit.transcript_id,
                chunk_index = unit.chunk_index,
                progress = format!("{}/{}", i + 1, units.len()),
                "Processing chunk"
            );
            let request = ctx.builder.build(unit);
            let response = runner.complete(&request).await?;
            self.deliver(ctx, unit, response, &delivery, report).await?;
        }
        Ok(())
    }

    async fn run_dry(&self, ctx: &RunContext, report: &mut RunReport) -> Result<(), PipelineError> {
        let units = self.select_units(ctx, None, true, report).await?;
        let requests: Vec<ExtractionRequest> = units.iter().map(|u| ctx.builder.build(u)).collect();
        report.requests = requests.len();

        let jsonl = batch_jsonl(&requests, &self.settings.model)?;
        tokio::fs::create_dir_all(&self.settings.batch_dir)
            .await
            .context(format!("Failed to create batch directory: {:?}", self.settings.batch_dir))?;
        let path = self
            .settings
            .batch_dir
            .join(format!("batch_input_{}.jsonl", Utc::now().timestamp()));
        tokio::fs::write(&path, jsonl)
            .await
            .context(format!("Failed to write batch input: {:?}", path))?;

        info!(path = %path.display(), requests = requests.len(), "Dry run wrote batch input");
        report.jsonl_path = Some(path);
        Ok(())
    }

    async fn run_full(&self, ctx: &RunContext, report: &mut RunReport) -> Result<(), PipelineError> {
        let previous = self.checkpoint.load().await?;
        if let Some(job_id) = previous
            .as_ref()
            .and_then(|s| s.in_flight())
            .and_then(|j| j.job_id.clone())
        {
            return Err(PipelineError::JobInFlight { job_id });
        }

        let units = self.select_units(ctx, None, true, report).await?;
        let mut keys: Vec<RequestKey> = units.iter().map(|u| u.key()).collect();
        let mut units: HashMap<RequestKey, TranscriptUnit> = units.into_iter().map(|u| (u.key(), u)).collect();

        // Requests an earlier job left pending belong to transcripts that may
        // already have rows, so the processed filter will not select them again.
        let carried = match &previous {
            Some(state) if state.prompt_version.as_deref() == Some(ctx.prompt_version.as_str()) => state
                .pending_request_keys
                .iter()
                .filter(|k| !units.contains_key(*k))
                .cloned()
                .collect::<BTreeSet<_>>(),
            Some(state) => {
                if !state.pending_request_keys.is_empty() {
                    warn!(
                        pending = state.pending_request_keys.len(),
                        checkpoint_version = state.prompt_version.as_deref().unwrap_or("-"),
                        "Discarding pending requests from another prompt version"
                    );
                }
                BTreeSet::new()
            }
            None => BTreeSet::new(),
        };
        if !carried.is_empty() {
            let rebuilt = self.units_for(&carried, report).await?;
            for key in carried.iter().filter(|k| !rebuilt.contains_key(*k)) {
                warn!(key = %key, "Pending request no longer matches a transcript chunk; dropping it");
                report.unresolvable += 1;
            }
            info!(carried = rebuilt.len(), "Carrying pending requests from an earlier run");
            keys.extend(carried.into_iter().filter(|k| rebuilt.contains_key(k)));
            units.extend(rebuilt);
        }

        report.requests = keys.len();
        if keys.is_empty() {
            info!("Nothing to process");
            return Ok(());
        }
        let backend = self.backend()?;

        self.checkpoint
            .save(&CheckpointState {
                prompt_version: Some(ctx.prompt_version.clone()),
                job: None,
                pending_request_keys: keys.iter().cloned().collect(),
                loaded_fingerprints: previous.map(|s| s.loaded_fingerprints).unwrap_or_default(),
            })
            .await?;

        self.run_batches(ctx, backend, &units, &keys, report).await
    }

    async fn run_resume(&self, ctx: &RunContext, report: &mut RunReport) -> Result<(), PipelineError> {
        let Some(state) = self.checkpoint.load().await? else {
            info!("No checkpoint to resume");
            return Ok(());
        };
        if let Some(version) = &state.prompt_version {
            if version != &ctx.prompt_version {
                return Err(PipelineError::PromptVersionMismatch {
                    checkpoint: version.clone(),
                    current: ctx.prompt_version.clone(),
                });
            }
        }

        let pending = &state.pending_request_keys;
        report.requests = pending.len();
        if pending.is_empty() {
            info!("Checkpoint has no pending requests");
            return Ok(());
        }
        let backend = self.backend()?;

        // Requests are rebuilt from the source; chunking is deterministic.
        let units = self.units_for(pending, report).await?;
        for key in pending.iter().filter(|k| !units.contains_key(*k)) {
            warn!(key = %key, "Pending request no longer matches a transcript chunk; dropping it");
            report.unresolvable += 1;
            self.checkpoint.mark_resolved(key).await?;
        }

        let resumable = state.job.clone().filter(|job| {
            job.job_id.is_some()
                && job.state != JobState::Failed
                && job.request_keys.iter().any(|k| pending.contains(k))
        });
        // A job that failed on the backend aborts the run; it is marked Failed,
        // so the next resume resubmits its keys.
        if let Some(job) = resumable {
            let outcome = self.orchestrator(backend.clone()).resume(job).await?;
            self.apply_outcome(ctx, &units, outcome, report).await?;
        }

        // The recorded job has settled; whatever it did not resolve goes out again.
        let still_pending = self
            .checkpoint
            .load()
            .await?
            .map(|s| s.pending_request_keys)
            .unwrap_or_default();
        let resubmit: Vec<RequestKey> = still_pending
            .into_iter()
            .filter(|k| units.contains_key(k))
            .collect();
        if !resubmit.is_empty() {
            info!(requests = resubmit.len(), "Resubmitting pending requests");
            self.run_batches(ctx, backend, &units, &resubmit, report).await?;
        }
        Ok(())
    }

    /// Re-derive the units behind a set of request keys.
    async fn units_for(
        &self,
        keys: &BTreeSet<RequestKey>,
        report: &mut RunReport,
    ) -> Result<HashMap<RequestKey, TranscriptUnit>, PipelineError> {
        let ids: Vec<String> = keys
            .iter()
            .map(|k| k.transcript_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let records = self.source.fetch_by_ids(&ids).await?;
        Ok(self
            .chunk(&records, report)
            .into_iter()
            .filter(|u| keys.contains(&u.key()))
            .map(|u| (u.key(), u))
            .collect())
    }

    fn orchestrator(&self, backend: Arc<dyn InferenceBackend>) -> BatchOrchestrator {
        BatchOrchestrator::new(
            backend,
            self.checkpoint.clone(),
            self.settings.batch.clone(),
            self.settings.retry.clone(),
        )
    }

    /// Submit `keys` as consecutive jobs of at most `max_requests_per_batch`.
    async fn run_batches(
        &self,
        ctx: &RunContext,
        backend: Arc<dyn InferenceBackend>,
        units: &HashMap<RequestKey, TranscriptUnit>,
        keys: &[RequestKey],
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let orchestrator = self.orchestrator(backend);
        let size = self.settings.batch.max_requests_per_batch.max(1);
        let total = keys.len().div_ceil(size);

        for (i, slice) in keys.chunks(size).enumerate() {
            let requests: Vec<ExtractionRequest> = slice
                .iter()
                .filter_map(|key| units.get(key))
                .map(|unit| ctx.builder.build(unit))
                .collect();
            if total > 1 {
                info!(sub_batch = i + 1, of = total, requests = requests.len(), "Submitting sub-batch");
            }
            let outcome = orchestrator.run(&requests).await?;
            self.apply_outcome(ctx, units, outcome, report).await?;
        }
        Ok(())
    }

    async fn apply_outcome(
        &self,
        ctx: &RunContext,
        units: &HashMap<RequestKey, TranscriptUnit>,
        outcome: BatchOutcome,
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let job_id = outcome.job.job_id.clone();
        if let Some(id) = &job_id {
            report.jobs.push(id.clone());
        }
        report.request_errors += outcome.failed_keys.len();

        let loaded = match self.checkpoint.load().await {
            Ok(state) => state.map(|s| s.loaded_fingerprints).unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Could not read loaded fingerprints; relying on sink uniqueness");
                BTreeSet::new()
            }
        };
        let delivery = Delivery {
            loader: Loader::new(self.sink.clone(), Some(self.checkpoint.clone())).with_loaded(loaded),
            batch_id: job_id.as_deref(),
            track: true,
        };
        for response in outcome.responses {
            let Some(unit) = units.get(&response.key) else {
                continue;
            };
            self.deliver(ctx, unit, response, &delivery, report).await?;
        }
        Ok(())
    }

    /// Parse one response and load its insights.
    ///
    /// The request is marked resolved only when the body decoded and every
    /// insight reached the sink; otherwise it stays pending for a resume.
    async fn deliver(
        &self,
        ctx: &RunContext,
        unit: &TranscriptUnit,
        response: RawResponse,
        delivery: &Delivery<'_>,
        report: &mut RunReport,
    ) -> Result<(), PipelineError> {
        let raw = match response.outcome {
            RawOutcome::Body(raw) => raw,
            RawOutcome::Error(error) => {
                warn!(key = %response.key, error = %error, "Request failed");
                report.request_errors += 1;
                return Ok(());
            }
        };
        report.responses += 1;

        let provenance = Provenance {
            model_used: self.settings.model.clone(),
            prompt_version: ctx.prompt_version.clone(),
            batch_id: delivery.batch_id.map(str::to_string),
            processed_at: Utc::now(),
        };
        let output = ctx.normalizer.parse(&raw, unit, &provenance);
        let malformed = output.is_malformed();
        report.confidence_clamped += output.clamped;

        for feature in &output.new_features {
            match self.features.append_feature(feature).await {
                Ok(_) => report.new_features.push(feature.code.clone()),
                Err(e) => warn!(code = %feature.code, error = %e, "Failed to store new feature name"),
            }
        }

        let (insights, errors) = output.split();
        for error in &errors {
            warn!(key = %response.key, reason = error.kind().as_str(), error = %error, "Dropped insight");
        }
        report.record_drops(&errors);
        report.insights_parsed += insights.len();

        let load = delivery.loader.upsert(&insights).await;
        report.record_load(&load);

        if delivery.track && !malformed && load.failed_keys.is_empty() {
            self.checkpoint.mark_resolved(&response.key).await?;
        }
        Ok(())
    }
}
