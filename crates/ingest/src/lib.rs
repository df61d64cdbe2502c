pub mod chunk;
pub mod chunker;
pub mod reader;
pub mod transcript;

pub use chunk::{RequestKey, TranscriptUnit};
pub use chunker::{ChunkError, ChunkSegment, Chunker, ChunkerConfig, estimate_tokens};
pub use reader::{FileTranscriptSource, TranscriptSource};
pub use transcript::{CrmContext, TranscriptRecord};

use std::collections::HashSet;
use tracing::warn;

/// Chunk a set of transcript records into request units.
///
/// Records repeated by the source are kept once (first occurrence wins).
/// Malformed transcripts are logged and skipped; their ids are returned so the
/// run report can count them.
pub fn chunk_records(
    chunker: &Chunker,
    records: &[TranscriptRecord],
) -> (Vec<TranscriptUnit>, Vec<String>) {
    let mut seen = HashSet::new();
    let mut units = Vec::new();
    let mut rejected = Vec::new();

    for record in records {
        if !seen.insert(record.transcript_id.as_str()) {
            continue;
        }
        match chunker.chunk_record(record) {
            Ok(chunks) => units.extend(chunks),
            Err(e) => {
                warn!(transcript_id = %record.transcript_id, error = %e, "Skipping malformed transcript");
                rejected.push(record.transcript_id.clone());
            }
        }
    }

    (units, rejected)
}
