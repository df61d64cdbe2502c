use anyhow::Result;
use async_trait::async_trait;
use extract::{FeatureNameEntry, Insight};
use std::collections::HashSet;

/// Append-mostly insight storage, unique on `content_hash`.
#[async_trait]
pub trait InsightSink: Send + Sync {
    /// Insert unless a row with the same `content_hash` exists.
    /// Returns `false` on a collision.
    async fn insert_if_absent(&self, insight: &Insight) -> Result<bool>;

    /// Transcripts that already have rows under `prompt_version`.
    async fn processed_transcripts(&self, prompt_version: &str) -> Result<HashSet<String>>;

    async fn insight_count(&self) -> Result<usize>;
}

/// The feature-name extension table.
#[async_trait]
pub trait FeatureSink: Send + Sync {
    /// Every stored feature, seeds first.
    async fn load_features(&self) -> Result<Vec<FeatureNameEntry>>;

    /// Returns `false` if the code was already stored.
    async fn append_feature(&self, entry: &FeatureNameEntry) -> Result<bool>;
}
