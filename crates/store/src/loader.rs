use batch::CheckpointStore;
use extract::Insight;
use ingest::RequestKey;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::sink::InsightSink;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct LoadReport {
    pub inserted: usize,
    pub skipped_duplicate: usize,
    pub failed: usize,
    /// Fingerprints now known to be in the sink, whether inserted or not.
    pub loaded_hashes: Vec<String>,
    /// Requests with at least one insight that failed to write.
    pub failed_keys: BTreeSet<RequestKey>,
}

impl LoadReport {
    pub fn merge(&mut self, other: LoadReport) {
        self.inserted += other.inserted;
        self.skipped_duplicate += other.skipped_duplicate;
        self.failed += other.failed;
        self.loaded_hashes.extend(other.loaded_hashes);
        self.failed_keys.extend(other.failed_keys);
    }
}

/// Writes insights into the sink, each at most once.
///
/// Fingerprints known to be loaded are skipped without touching the sink;
/// anything else relies on the sink's uniqueness on `content_hash`.
pub struct Loader {
    sink: Arc<dyn InsightSink>,
    checkpoint: Option<Arc<dyn CheckpointStore>>,
    loaded: BTreeSet<String>,
}

impl Loader {
    pub fn new(sink: Arc<dyn InsightSink>, checkpoint: Option<Arc<dyn CheckpointStore>>) -> Self {
        Self {
            sink,
            checkpoint,
            loaded: BTreeSet::new(),
        }
    }

    /// Fingerprints already recorded as loaded.
    pub fn with_loaded(mut self, loaded: BTreeSet<String>) -> Self {
        self.loaded = loaded;
        self
    }

    /// A write failure for one insight is recorded and loading continues.
    pub async fn upsert(&self, insights: &[Insight]) -> LoadReport {
        let mut report = LoadReport::default();

        for insight in insights {
            if self.loaded.contains(&insight.content_hash) {
                report.skipped_duplicate += 1;
                report.loaded_hashes.push(insight.content_hash.clone());
                continue;
            }

            match self.sink.insert_if_absent(insight).await {
                Ok(inserted) => {
                    if inserted {
                        report.inserted += 1;
                    } else {
                        debug!(content_hash = %insight.content_hash, "Insight already loaded");
                        report.skipped_duplicate += 1;
                    }
                    report.loaded_hashes.push(insight.content_hash.clone());
                    if let Some(checkpoint) = &self.checkpoint {
                        if let Err(e) = checkpoint.mark_loaded(&insight.content_hash).await {
                            warn!(content_hash = %insight.content_hash, error = %e, "Failed to checkpoint loaded insight");
                        }
                    }
                }
                Err(e) => {
                    error!(
                        transcript_id = %insight.transcript_id,
                        chunk_index = insight.transcript_chunk,
                        content_hash = %insight.content_hash,
                        error = %e,
                        "Failed to write insight"
                    );
                    report.failed += 1;
                    report
                        .failed_keys
                        .insert(RequestKey::new(insight.transcript_id.clone(), insight.transcript_chunk));
                }
            }
        }
        report
    }
}
