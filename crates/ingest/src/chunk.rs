use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::transcript::CrmContext;

/// Correlates an asynchronous response with the chunk that produced it.
///
/// Serialized as `"{transcript_id}__{chunk_index}"`. Parsing splits on the last
/// `__`, so transcript ids may themselves contain double underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestKey {
    pub transcript_id: String,
    pub chunk_index: u32,
}

impl RequestKey {
    pub fn new(transcript_id: impl Into<String>, chunk_index: u32) -> Self {
        Self {
            transcript_id: transcript_id.into(),
            chunk_index,
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}__{}", self.transcript_id, self.chunk_index)
    }
}

impl FromStr for RequestKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (transcript_id, index) = s
            .rsplit_once("__")
            .ok_or_else(|| format!("request key '{}' has no chunk separator", s))?;
        if transcript_id.is_empty() {
            return Err(format!("request key '{}' has an empty transcript id", s));
        }
        let chunk_index = index
            .parse::<u32>()
            .map_err(|e| format!("request key '{}' has a bad chunk index: {}", s, e))?;
        Ok(Self::new(transcript_id, chunk_index))
    }
}

impl TryFrom<String> for RequestKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RequestKey> for String {
    fn from(key: RequestKey) -> Self {
        key.to_string()
    }
}

/// One chunk of one transcript, submitted as a single inference request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptUnit {
    pub transcript_id: String,
    pub chunk_index: u32,
    pub text: String,
    pub token_count: usize,
    pub offset: (usize, usize), // [start, end) byte positions in the transcript
    /// A single speaker turn that alone exceeds the token budget.
    pub oversized: bool,
    pub crm_context: CrmContext,
}

impl TranscriptUnit {
    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.transcript_id.clone(), self.chunk_index)
    }
}
