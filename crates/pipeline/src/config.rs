use anyhow::{Context, Result, ensure};
use batch::{BatchConfig, RetryPolicy};
use extract::PromptVersion;
use ingest::ChunkerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub openai: OpenAiConfig,
    pub paths: PathsConfig,
    pub chunking: ChunkingConfig,
    pub batch: BatchSettings,
    pub retry: RetryConfig,
    pub prompt: PromptConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub model: String,
    /// Normally supplied through `OPENAI_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub completion_window: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub database: PathBuf,
    /// Where dry runs write batch input files.
    pub batch_dir: PathBuf,
    /// QA refinements; ignored when the file does not exist.
    pub refinements: PathBuf,
    /// Overrides the built-in taxonomy.
    pub taxonomy: Option<PathBuf>,
    /// Overrides the built-in worked examples.
    pub few_shot: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub poll_interval_secs: u64,
    /// Report a job still running after this long. `None` waits indefinitely.
    pub max_poll_secs: Option<u64>,
    pub max_requests_per_batch: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Base version; a QA revision suffix is added when refinements apply.
    pub version: String,
    pub summary_language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub transcript_view: String,
    /// Read transcripts from a JSON/JSONL export instead of the database view.
    pub transcripts_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai: OpenAiConfig::default(),
            paths: PathsConfig::default(),
            chunking: ChunkingConfig::default(),
            batch: BatchSettings::default(),
            retry: RetryConfig::default(),
            prompt: PromptConfig::default(),
            source: SourceConfig::default(),
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            request_timeout_secs: 120,
            completion_window: "24h".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("data/insights.db"),
            batch_dir: PathBuf::from("batch_files"),
            refinements: PathBuf::from("prompt_refinements.json"),
            taxonomy: None,
            few_shot: None,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { max_tokens: 12_000 }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            max_poll_secs: Some(26 * 3600),
            max_requests_per_batch: 2000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10000,
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            version: "v2.0".to_string(),
            summary_language: "English".to_string(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            transcript_view: "v_transcripts".to_string(),
            transcripts_file: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid {}='{}': {}", name, value, e))
}

impl AppConfig {
    /// Defaults, then the TOML file if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig =
            toml::from_str(&content).context(format!("Failed to parse config file: {:?}", path))?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply the deployment's environment variables.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(key) = var("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.openai.api_key = Some(key);
        }
        if let Some(model) = var("OPENAI_MODEL") {
            self.openai.model = model;
        }
        if let Some(url) = var("OPENAI_BASE_URL") {
            self.openai.base_url = url;
        }
        if let Some(v) = var("BATCH_POLL_INTERVAL") {
            self.batch.poll_interval_secs = parse_env("BATCH_POLL_INTERVAL", &v)?;
        }
        if let Some(v) = var("MAX_TOKENS_PER_CHUNK") {
            self.chunking.max_tokens = parse_env("MAX_TOKENS_PER_CHUNK", &v)?;
        }
        if let Some(version) = var("PROMPT_VERSION") {
            self.prompt.version = version;
        }
        if let Some(view) = var("TRANSCRIPT_VIEW_NAME") {
            self.source.transcript_view = view;
        }
        if let Some(db) = var("INSIGHTS_DATABASE") {
            self.paths.database = PathBuf::from(db);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.chunking.max_tokens > 0, "chunking.max_tokens must be positive");
        ensure!(self.batch.poll_interval_secs > 0, "batch.poll_interval_secs must be positive");
        ensure!(
            self.batch.max_requests_per_batch > 0,
            "batch.max_requests_per_batch must be positive"
        );
        PromptVersion::parse(&self.prompt.version)?;
        Ok(())
    }

    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_tokens: self.chunking.max_tokens,
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            poll_interval: Duration::from_secs(self.batch.poll_interval_secs),
            max_poll_duration: self.batch.max_poll_secs.map(Duration::from_secs),
            max_requests_per_batch: self.batch.max_requests_per_batch,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_retries,
            self.retry.initial_backoff_ms,
            self.retry.max_backoff_ms,
        )
    }
}
