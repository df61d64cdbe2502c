use extract::ExtractionRequest;
use std::sync::Arc;
use tracing::warn;

use crate::backend::{BackendError, InferenceBackend, RawOutcome, RawResponse};
use crate::retry::RetryPolicy;

/// Sends requests one at a time and returns each answer as soon as it
/// arrives. Used for samples and dry runs where waiting on a batch job
/// would be pointless.
pub struct DirectRunner {
    backend: Arc<dyn InferenceBackend>,
    retry: RetryPolicy,
}

impl DirectRunner {
    pub fn new(backend: Arc<dyn InferenceBackend>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// A per-request failure comes back as [`RawOutcome::Error`] so the run
    /// can continue. Only credential problems abort.
    pub async fn complete(&self, request: &ExtractionRequest) -> Result<RawResponse, BackendError> {
        let result = self
            .retry
            .retry("complete", || self.backend.complete(request))
            .await;

        let outcome = match result {
            Ok(body) => RawOutcome::Body(body),
            Err(e @ BackendError::Unauthorized { .. }) => return Err(e),
            Err(e) => {
                warn!(key = %request.key, error = %e, "Direct request failed");
                RawOutcome::Error(e.to_string())
            }
        };
        Ok(RawResponse {
            key: request.key.clone(),
            outcome,
        })
    }
}
