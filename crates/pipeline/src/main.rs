use anyhow::{Context, Result};
use batch::{CheckpointStore, InferenceBackend, OpenAiBackend};
use clap::{Parser, Subcommand, ValueEnum};
use extract::PromptVersion;
use ingest::{FileTranscriptSource, TranscriptSource};
use pipeline::{AppConfig, Pipeline, PipelineError, PipelineSettings, RunMode};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use store::{FeatureSink, InsightSink, SqliteStore};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Extract structured insights from sales call transcripts.
#[derive(Parser, Debug)]
#[command(name = "insights")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "INSIGHTS_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema and seed the taxonomy's feature names
    Setup {
        /// Load transcripts from a JSON or JSONL export into the database
        #[arg(long)]
        import: Option<PathBuf>,
    },
    /// Process transcripts
    Run {
        /// Process the first N transcripts synchronously
        #[arg(long, group = "mode")]
        sample: Option<usize>,

        /// Write the batch input file without submitting it
        #[arg(long, group = "mode")]
        dry_run: bool,

        /// Continue from the checkpoint
        #[arg(long, group = "mode")]
        resume: bool,

        /// Include transcripts already processed under this prompt version
        #[arg(long)]
        force: bool,

        /// Override the configured model
        #[arg(long)]
        model: Option<String>,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show checkpoint and job progress
    Status {
        /// Clear the checkpoint, forgetting pending requests
        #[arg(long)]
        reset: bool,
    },
    /// Print the effective prompt version
    Version {
        /// Also print the next version to configure after a prompt or taxonomy change
        #[arg(long, value_enum)]
        bump: Option<Bump>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Bump {
    /// New taxonomy or output shape
    Major,
    /// Instruction or example changes
    Minor,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Fatal error");
            eprintln!("error: {:#}", e);
            if e
                .downcast_ref::<PipelineError>()
                .is_some_and(PipelineError::is_resumable)
            {
                eprintln!("progress is checkpointed; run `insights run --resume` to continue");
            }
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load(cli.config.as_deref())?;

    let store = Arc::new(SqliteStore::open(&config.paths.database, &config.source.transcript_view).await?);
    store.init_schema().await?;

    match cli.command {
        Command::Setup { import } => setup(&config, &store, import).await,
        Command::Version { bump } => version(&config, bump),
        Command::Run {
            sample,
            dry_run,
            resume,
            force,
            model,
            json,
        } => {
            if let Some(model) = model {
                config.openai.model = model;
            }
            let mode = match (sample, dry_run, resume) {
                (Some(n), _, _) => RunMode::Sample(n),
                (None, true, _) => RunMode::DryRun,
                (None, false, true) => RunMode::Resume,
                (None, false, false) => RunMode::Full,
            };

            let mut settings = PipelineSettings::from_config(&config)?;
            settings.force = force;
            let pipeline = build_pipeline(&config, store, settings)?;

            let report = pipeline.run(mode).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report);
            }
            Ok(())
        }
        Command::Status { reset } => {
            let settings = PipelineSettings::from_config(&config)?;
            let versions = store.counts_by_version().await?;
            let pipeline = build_pipeline(&config, store, settings)?;
            if reset {
                pipeline.reset().await?;
            }

            println!("{}", pipeline.status().await?);
            if !versions.is_empty() {
                println!("Insights by prompt version:");
                for (version, count) in versions {
                    println!("  {:<12} {}", version, count);
                }
            }
            Ok(())
        }
    }
}

fn version(config: &AppConfig, bump: Option<Bump>) -> Result<()> {
    let settings = PipelineSettings::from_config(config)?;
    let current = PromptVersion::resolve(&config.prompt.version, settings.refinements.as_ref())?;
    println!("Prompt version: {}", current);

    if let Some(bump) = bump {
        let next = match bump {
            Bump::Major => current.bump_major(),
            Bump::Minor => current.bump_minor(),
        };
        println!("Next version:   {} (set [prompt] version in the config file)", next);
    }
    Ok(())
}

async fn setup(config: &AppConfig, store: &SqliteStore, import: Option<PathBuf>) -> Result<()> {
    let settings = PipelineSettings::from_config(config)?;
    let seeded = store.seed_features(&settings.taxonomy).await?;
    info!(seeded, "Seeded feature names");

    if let Some(path) = import {
        let records = FileTranscriptSource::new(&path)
            .fetch_transcripts(None)
            .await
            .context(format!("Failed to read transcripts from {:?}", path))?;
        let imported = store.import_transcripts(&records).await?;
        info!(imported, path = %path.display(), "Imported transcripts");
    }

    println!("Database ready at {}", config.paths.database.display());
    Ok(())
}

fn build_pipeline(config: &AppConfig, store: Arc<SqliteStore>, settings: PipelineSettings) -> Result<Pipeline> {
    let source: Arc<dyn TranscriptSource> = match &config.source.transcripts_file {
        Some(path) => {
            info!(path = %path.display(), "Reading transcripts from file");
            Arc::new(FileTranscriptSource::new(path))
        }
        None => store.clone(),
    };

    let backend: Option<Arc<dyn InferenceBackend>> = match &config.openai.api_key {
        Some(key) => {
            let backend = OpenAiBackend::new(
                key,
                &config.openai.base_url,
                &config.openai.model,
                Duration::from_secs(config.openai.request_timeout_secs),
                &config.openai.completion_window,
            )?;
            Some(Arc::new(backend) as Arc<dyn InferenceBackend>)
        }
        None => {
            warn!("OPENAI_API_KEY is not set; only dry runs and status are available");
            None
        }
    };

    let sink: Arc<dyn InsightSink> = store.clone();
    let features: Arc<dyn FeatureSink> = store.clone();
    let checkpoint: Arc<dyn CheckpointStore> = store;
    Ok(Pipeline::new(source, sink, features, checkpoint, backend, settings))
}
