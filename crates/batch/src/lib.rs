pub mod backend;
pub mod checkpoint;
pub mod direct;
pub mod openai;
pub mod orchestrator;
pub mod retry;
pub mod state;

#[cfg(test)]
mod testing;

pub use backend::{BackendError, InferenceBackend, JobStatus, RawOutcome, RawResponse, RemoteState};
pub use checkpoint::{CheckpointState, CheckpointStore};
pub use direct::DirectRunner;
pub use openai::{OpenAiBackend, batch_jsonl, chat_body};
pub use orchestrator::{BatchConfig, BatchError, BatchOrchestrator, BatchOutcome};
pub use retry::{RetryPolicy, Retryable};
pub use state::{BatchJob, JobState, StateError};
