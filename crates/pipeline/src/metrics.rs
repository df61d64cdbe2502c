use extract::{ParseError, ParseErrorKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use store::LoadReport;
use tracing::info;

/// Counts for one pipeline run, logged and printed at the end.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunReport {
    pub mode: String,
    pub prompt_version: String,

    pub transcripts: usize,
    /// Transcripts whose text could not be chunked.
    pub rejected_transcripts: usize,
    pub requests: usize,
    /// Requests answered with a body.
    pub responses: usize,
    /// Requests the backend reported as failed or never answered.
    pub request_errors: usize,
    /// Bodies that were not valid structured output.
    pub malformed_responses: usize,
    /// Pending keys whose transcript or chunk no longer exists.
    pub unresolvable: usize,

    pub insights_parsed: usize,
    pub insights_dropped: usize,
    pub confidence_clamped: usize,
    pub drop_reasons: BTreeMap<String, usize>,

    pub inserted: usize,
    pub skipped_duplicate: usize,
    pub load_failed: usize,

    pub new_features: Vec<String>,
    pub jobs: Vec<String>,
    /// Request keys still pending in the checkpoint after the run.
    pub pending_after: usize,
    pub jsonl_path: Option<PathBuf>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn new(mode: &str, prompt_version: &str) -> Self {
        Self {
            mode: mode.to_string(),
            prompt_version: prompt_version.to_string(),
            ..Default::default()
        }
    }

    pub fn record_drops(&mut self, errors: &[ParseError]) {
        for error in errors {
            let kind = error.kind();
            if kind == ParseErrorKind::MalformedResponse {
                self.malformed_responses += 1;
            } else {
                self.insights_dropped += 1;
            }
            *self.drop_reasons.entry(kind.as_str().to_string()).or_default() += 1;
        }
    }

    pub fn record_load(&mut self, load: &LoadReport) {
        self.inserted += load.inserted;
        self.skipped_duplicate += load.skipped_duplicate;
        self.load_failed += load.failed;
    }

    pub fn log_summary(&self) {
        info!(
            mode = %self.mode,
            prompt_version = %self.prompt_version,
            transcripts = self.transcripts,
            requests = self.requests,
            responses = self.responses,
            request_errors = self.request_errors,
            malformed = self.malformed_responses,
            parsed = self.insights_parsed,
            dropped = self.insights_dropped,
            inserted = self.inserted,
            duplicates = self.skipped_duplicate,
            load_failed = self.load_failed,
            pending = self.pending_after,
            elapsed_ms = self.elapsed_ms,
            "Run complete"
        );
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Run summary ({}, {}) ===", self.mode, self.prompt_version)?;
        writeln!(f, "Transcripts:        {}", self.transcripts)?;
        if self.rejected_transcripts > 0 {
            writeln!(f, "  rejected:         {}", self.rejected_transcripts)?;
        }
        writeln!(f, "Requests:           {}", self.requests)?;
        writeln!(f, "  answered:         {}", self.responses)?;
        writeln!(f, "  backend errors:   {}", self.request_errors)?;
        writeln!(f, "  malformed:        {}", self.malformed_responses)?;
        if self.unresolvable > 0 {
            writeln!(f, "  unresolvable:     {}", self.unresolvable)?;
        }
        writeln!(f, "Insights parsed:    {}", self.insights_parsed)?;
        writeln!(f, "  dropped:          {}", self.insights_dropped)?;
        writeln!(f, "  clamped:          {}", self.confidence_clamped)?;
        writeln!(f, "  inserted:         {}", self.inserted)?;
        writeln!(f, "  duplicates:       {}", self.skipped_duplicate)?;
        writeln!(f, "  failed to load:   {}", self.load_failed)?;
        if !self.drop_reasons.is_empty() {
            writeln!(f, "Drop reasons:")?;
            for (reason, count) in &self.drop_reasons {
                writeln!(f, "  {:<22} {}", reason, count)?;
            }
        }
        if !self.new_features.is_empty() {
            writeln!(f, "New features:       {}", self.new_features.join(", "))?;
        }
        if !self.jobs.is_empty() {
            writeln!(f, "Batch jobs:         {}", self.jobs.join(", "))?;
        }
        if let Some(path) = &self.jsonl_path {
            writeln!(f, "Batch input:        {}", path.display())?;
        }
        writeln!(f, "Pending requests:   {}", self.pending_after)?;
        write!(f, "Elapsed:            {:.1}s", self.elapsed_ms as f64 / 1000.0)
    }
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
