use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::transcript::TranscriptRecord;

/// A sequence of transcript records with joined CRM fields.
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    /// Records in source order, at most `limit` of them when given.
    async fn fetch_transcripts(&self, limit: Option<usize>) -> Result<Vec<TranscriptRecord>>;

    /// Records whose id is in `ids`. Unknown ids are skipped.
    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<TranscriptRecord>>;
}

/// Reads transcript exports from disk: a `.json` array, a `.jsonl` file, or a
/// directory containing either.
pub struct FileTranscriptSource {
    root: PathBuf,
}

impl FileTranscriptSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_all(&self) -> Result<Vec<TranscriptRecord>> {
        let mut records = Vec::new();
        for path in self.files()? {
            records.extend(read_file(&path).await?);
        }
        debug!(root = %self.root.display(), count = records.len(), "Read transcript records");
        Ok(records)
    }

    fn files(&self) -> Result<Vec<PathBuf>> {
        if self.root.is_file() {
            return Ok(vec![self.root.clone()]);
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.context(format!("Failed to walk directory: {:?}", self.root))?;
            let path = entry.path();
            if path.is_file() && is_transcript_file(path) {
                files.push(path.to_path_buf());
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl TranscriptSource for FileTranscriptSource {
    async fn fetch_transcripts(&self, limit: Option<usize>) -> Result<Vec<TranscriptRecord>> {
        let mut records = self.read_all().await?;
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<TranscriptRecord>> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| wanted.contains(r.transcript_id.as_str()))
            .collect())
    }
}

fn is_transcript_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json") | Some("jsonl")
    )
}

async fn read_file(path: &Path) -> Result<Vec<TranscriptRecord>> {
    let content = fs::read_to_string(path)
        .await
        .context(format!("Failed to read file: {:?}", path))?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("jsonl") => {
            let mut records = Vec::new();
            for (line_no, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<TranscriptRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(
                        file = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping unreadable transcript line"
                    ),
                }
            }
            Ok(records)
        }
        Some("json") => serde_json::from_str(&content)
            .context(format!("Failed to parse transcript array: {:?}", path)),
        other => anyhow::bail!("Unsupported file format: {:?}", other),
    }
}
