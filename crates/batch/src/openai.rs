use anyhow::{Context, Result};
use async_trait::async_trait;
use extract::{ExtractionRequest, response_format};
use ingest::RequestKey;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, InferenceBackend, JobStatus, RawOutcome, RawResponse, RemoteState};

const CHAT_ENDPOINT: &str = "/v1/chat/completions";

/// OpenAI chat-completions and batch API client.
#[derive(Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
    completion_window: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Deserialize)]
struct BatchObject {
    id: String,
    status: String,
    output_file_id: Option<String>,
    error_file_id: Option<String>,
    request_counts: Option<RequestCounts>,
}

#[derive(Deserialize, Default)]
struct RequestCounts {
    total: usize,
    completed: usize,
    failed: usize,
}

#[derive(Deserialize)]
struct ResultLine {
    custom_id: String,
    response: Option<ResultEnvelope>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ResultEnvelope {
    status_code: u16,
    body: Value,
}

impl OpenAiBackend {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        timeout: Duration,
        completion_window: &str,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing OpenAI API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing OpenAI model name");

        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid OpenAI API key")?,
        );
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build OpenAI HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            completion_window: completion_window.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        Err(BackendError::from_status(status.as_u16(), body))
    }

    async fn batch_object(&self, job_id: &str) -> Result<BatchObject, BackendError> {
        let response = self
            .send(self.client.get(self.url(&format!("/batches/{}", job_id))))
            .await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("batch object: {}", e)))
    }

    async fn file_content(&self, file_id: &str) -> Result<String, BackendError> {
        let response = self
            .send(self.client.get(self.url(&format!("/files/{}/content", file_id))))
            .await?;
        response.text().await.map_err(classify)
    }
}

/// The chat-completions body for one request.
pub fn chat_body(request: &ExtractionRequest, model: &str) -> Value {
    json!({
        "model": model,
        "temperature": 0,
        "response_format": response_format(),
        "messages": [
            { "role": "system", "content": &*request.system_prompt },
            { "role": "user", "content": request.user_prompt },
        ],
    })
}

/// Render a request set as batch-API input lines.
pub fn batch_jsonl(requests: &[ExtractionRequest], model: &str) -> Result<String> {
    let mut out = String::new();
    for request in requests {
        let line = json!({
            "custom_id": request.key.to_string(),
            "method": "POST",
            "url": CHAT_ENDPOINT,
            "body": chat_body(request, model),
        });
        out.push_str(&serde_json::to_string(&line).context("Failed to encode batch line")?);
        out.push('\n');
    }
    Ok(out)
}

fn classify(e: reqwest::Error) -> BackendError {
    if e.is_decode() {
        BackendError::InvalidResponse(e.to_string())
    } else {
        BackendError::Transient(e.to_string())
    }
}

fn remote_state(status: &str) -> RemoteState {
    match status {
        "completed" => RemoteState::Completed,
        "failed" => RemoteState::Failed,
        "expired" => RemoteState::Expired,
        "cancelled" | "cancelling" => RemoteState::Cancelled,
        _ => RemoteState::InProgress,
    }
}

fn message_content(body: &Value) -> Option<String> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

/// Parse a batch output or error file.
fn parse_result_lines(text: &str) -> Vec<RawResponse> {
    let mut results = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let parsed: ResultLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable batch result line");
                continue;
            }
        };
        let key: RequestKey = match parsed.custom_id.parse() {
            Ok(key) => key,
            Err(e) => {
                warn!(custom_id = %parsed.custom_id, error = %e, "Skipping result with unknown custom_id");
                continue;
            }
        };

        let outcome = match (parsed.error, parsed.response) {
            (Some(error), _) if !error.is_null() => RawOutcome::Error(error.to_string()),
            (_, Some(envelope)) if envelope.status_code == 200 => {
                RawOutcome::Body(message_content(&envelope.body).unwrap_or_default())
            }
            (_, Some(envelope)) => RawOutcome::Error(format!(
                "HTTP {}: {}",
                envelope.status_code, envelope.body
            )),
            (_, None) => RawOutcome::Error("no response recorded".to_string()),
        };
        results.push(RawResponse { key, outcome });
    }
    results
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ExtractionRequest) -> Result<String, BackendError> {
        let response = self
            .send(
                self.client
                    .post(self.url("/chat/completions"))
                    .json(&chat_body(request, &self.model)),
            )
            .await?;

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("chat completion: {}", e)))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::InvalidResponse("chat completion has no content".into()))
    }

    async fn submit_batch(&self, requests: &[ExtractionRequest]) -> Result<String, BackendError> {
        let jsonl = batch_jsonl(requests, &self.model)
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        let part = Part::bytes(jsonl.into_bytes())
            .file_name("batch_input.jsonl")
            .mime_str("application/jsonl")
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
        let form = Form::new().text("purpose", "batch").part("file", part);

        let file: FileObject = self
            .send(self.client.post(self.url("/files")).multipart(form))
            .await?
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("file upload: {}", e)))?;
        debug!(file_id = %file.id, "Uploaded batch input file");

        let batch: BatchObject = self
            .send(self.client.post(self.url("/batches")).json(&json!({
                "input_file_id": file.id,
                "endpoint": CHAT_ENDPOINT,
                "completion_window": self.completion_window,
            })))
            .await?
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("batch create: {}", e)))?;

        info!(job_id = %batch.id, status = %batch.status, requests = requests.len(), "Batch created");
        Ok(batch.id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobStatus, BackendError> {
        let batch = self.batch_object(job_id).await?;
        let counts = batch.request_counts.unwrap_or_default();
        Ok(JobStatus {
            remote: remote_state(&batch.status),
            total: counts.total,
            completed: counts.completed,
            failed: counts.failed,
        })
    }

    async fn fetch_results(&self, job_id: &str) -> Result<Vec<RawResponse>, BackendError> {
        let batch = self.batch_object(job_id).await?;

        let mut results = Vec::new();
        for file_id in [&batch.output_file_id, &batch.error_file_id].into_iter().flatten() {
            let text = self.file_content(file_id).await?;
            results.extend(parse_result_lines(&text));
        }
        info!(job_id = %batch.id, results = results.len(), "Downloaded batch results");
        Ok(results)
    }
}
