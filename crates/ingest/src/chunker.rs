use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::chunk::TranscriptUnit;
use crate::transcript::TranscriptRecord;

/// Lines that open a new speaker turn: `Name:`, `Speaker 2:`, `[Host]:` or a timestamp.
static SPEAKER_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[A-Z][a-zA-Z \t]*?:|Speaker\s*\d+:|\[[^\]]+\]:|\d{1,2}:\d{2})")
        .expect("speaker pattern is a valid regex")
});

#[derive(Debug, Error, PartialEq)]
pub enum ChunkError {
    #[error("transcript {transcript_id} is malformed: {reason} at byte {position}")]
    Malformed {
        transcript_id: String,
        reason: String,
        position: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkerConfig {
    pub max_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self { max_tokens: 12_000 }
    }
}

/// A token-bounded slice of a transcript, before CRM context is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSegment {
    pub chunk_index: u32,
    pub text: String,
    pub token_count: usize,
    pub offset: (usize, usize),
    pub oversized: bool,
}

#[derive(Debug, Clone, Copy)]
struct Turn {
    start: usize,
    end: usize,
    words: usize,
}

pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn max_tokens(&self) -> usize {
        self.config.max_tokens
    }

    /// Split a transcript into segments of at most `max_tokens`, cutting only
    /// at speaker-turn boundaries.
    ///
    /// A single turn larger than the budget is emitted whole as its own
    /// segment with `oversized` set; nothing is ever truncated.
    pub fn chunk(&self, transcript_id: &str, text: &str) -> Result<Vec<ChunkSegment>, ChunkError> {
        validate_text(transcript_id, text)?;

        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let total_tokens = estimate_tokens(text);
        if total_tokens <= self.config.max_tokens {
            return Ok(vec![ChunkSegment {
                chunk_index: 0,
                text: text.to_string(),
                token_count: total_tokens,
                offset: (0, text.len()),
                oversized: false,
            }]);
        }

        let turns = split_into_turns(text);
        let mut segments: Vec<ChunkSegment> = Vec::new();
        let mut current: Option<Turn> = None;

        for turn in turns {
            let turn_tokens = tokens_for_words(turn.words);

            if turn_tokens > self.config.max_tokens {
                if let Some(buffer) = current.take() {
                    segments.push(make_segment(text, buffer, segments.len(), false));
                }
                warn!(
                    transcript_id,
                    tokens = turn_tokens,
                    max_tokens = self.config.max_tokens,
                    "Single speaker turn exceeds token budget, emitting oversized chunk"
                );
                segments.push(make_segment(text, turn, segments.len(), true));
                continue;
            }

            current = match current {
                Some(buffer)
                    if tokens_for_words(buffer.words + turn.words) > self.config.max_tokens =>
                {
                    segments.push(make_segment(text, buffer, segments.len(), false));
                    Some(turn)
                }
                Some(buffer) => Some(Turn {
                    start: buffer.start,
                    end: turn.end,
                    words: buffer.words + turn.words,
                }),
                None => Some(turn),
            };
        }

        if let Some(buffer) = current {
            segments.push(make_segment(text, buffer, segments.len(), false));
        }

        debug!(
            transcript_id,
            total_tokens,
            chunks = segments.len(),
            "Chunked transcript"
        );
        Ok(segments)
    }

    /// Chunk a transcript record and attach its CRM context to every unit.
    pub fn chunk_record(&self, record: &TranscriptRecord) -> Result<Vec<TranscriptUnit>, ChunkError> {
        let segments = self.chunk(&record.transcript_id, &record.transcript_text)?;

        Ok(segments
            .into_iter()
            .map(|segment| TranscriptUnit {
                transcript_id: record.transcript_id.clone(),
                chunk_index: segment.chunk_index,
                text: segment.text,
                token_count: segment.token_count,
                offset: segment.offset,
                oversized: segment.oversized,
                crm_context: record.crm.clone(),
            })
            .collect())
    }
}

/// Estimate token count (rough: 1.3 tokens per word)
pub fn estimate_tokens(text: &str) -> usize {
    tokens_for_words(text.split_whitespace().count())
}

fn tokens_for_words(words: usize) -> usize {
    words * 13 / 10
}

fn make_segment(text: &str, turn: Turn, index: usize, oversized: bool) -> ChunkSegment {
    ChunkSegment {
        chunk_index: index as u32,
        text: text[turn.start..turn.end].to_string(),
        token_count: tokens_for_words(turn.words),
        offset: (turn.start, turn.end),
        oversized,
    }
}

/// Split at lines that open a speaker turn. Turns are contiguous byte ranges
/// covering the whole text; anything before the first marker is its own turn.
fn split_into_turns(text: &str) -> Vec<Turn> {
    let mut turns = Vec::new();
    let mut turn_start = 0;
    let mut turn_words = 0;
    let mut position = 0;

    for line in text.split_inclusive('\n') {
        let opens_turn = SPEAKER_PATTERN.is_match(line.trim_start());
        if opens_turn && position > turn_start {
            turns.push(Turn {
                start: turn_start,
                end: position,
                words: turn_words,
            });
            turn_start = position;
            turn_words = 0;
        }
        turn_words += line.split_whitespace().count();
        position += line.len();
    }

    if position > turn_start {
        turns.push(Turn {
            start: turn_start,
            end: position,
            words: turn_words,
        });
    }

    turns
}

fn validate_text(transcript_id: &str, text: &str) -> Result<(), ChunkError> {
    let bad = text
        .char_indices()
        .find(|(_, c)| c.is_control() && !matches!(c, '\n' | '\r' | '\t'));

    match bad {
        Some((position, c)) => Err(ChunkError::Malformed {
            transcript_id: transcript_id.to_string(),
            reason: format!("control character U+{:04X}", c as u32),
            position,
        }),
        None => Ok(()),
    }
}
