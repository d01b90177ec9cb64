//! `lumina` -- terminal front end for the Lumina document backend.
//!
//! Starts backend jobs, follows them to completion over the status
//! WebSocket (falling back to polling), and prints every update.
//! Results go to stdout as JSON; logs go to stderr.
//!
//! # Environment variables
//!
//! | Variable                      | Default                 | Description                 |
//! |-------------------------------|-------------------------|-----------------------------|
//! | `LUMINA_API_BASE_URL`         | `http://localhost:8000` | HTTP base URL               |
//! | `LUMINA_WS_BASE_URL`          | `ws://localhost:8000`   | Status WebSocket base URL   |
//! | `LUMINA_POLL_INTERVAL_MS`     | `2000`                  | Fallback polling interval   |
//! | `LUMINA_REQUEST_TIMEOUT_SECS` | `120`                   | HTTP request timeout        |
//! | `RUST_LOG`                    | `lumina=info`           | Log filter                  |

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use lumina_core::config::ClientConfig;
use lumina_core::types::{JobUpdate, SessionId};
use lumina_jobs::api::{ExportFormat, SchemaField};
use lumina_pipeline::{Pipeline, QueryOutcome, StageUpdate, DEFAULT_INTENTION};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "lumina", version, about = "Track Lumina backend jobs")]
struct Cli {
    /// Override the fallback polling interval in milliseconds
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow an existing job until it completes or fails
    Track {
        /// Job id returned by a job-starting endpoint
        job_id: String,
    },
    /// Upload documents into a new session
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Classify documents and recommend an extraction schema
    Analyze { session_id: SessionId },
    /// Extract structured records, then index them
    Extract {
        session_id: SessionId,
        /// What to extract
        #[arg(long, default_value = DEFAULT_INTENTION)]
        intention: String,
        /// JSON file with the edited schema fields, saved before extraction
        #[arg(long)]
        schema: Option<PathBuf>,
    },
    /// Ask a question about the extracted data
    Query {
        session_id: SessionId,
        text: String,
        #[arg(long, default_value_t = 5)]
        num_results: u32,
    },
    /// Build a knowledge graph from the records relevant to a question
    Graph {
        session_id: SessionId,
        text: String,
        #[arg(long, default_value_t = 5)]
        num_results: u32,
    },
    /// Download the extracted data
    Export {
        #[arg(value_enum)]
        format: Format,
        /// Write to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Check that the backend is reachable
    Health,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Csv,
}

impl From<Format> for ExportFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => ExportFormat::Json,
            Format::Csv => ExportFormat::Csv,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lumina=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::from_env().context("Invalid configuration")?;
    if let Some(ms) = cli.poll_interval_ms {
        config.poll_interval = Duration::from_millis(ms);
    }

    tracing::debug!(
        api_base_url = %config.api_base_url,
        ws_base_url = %config.ws_base_url,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "Loaded configuration",
    );

    let pipeline = Pipeline::from_config(&config).context("Failed to build HTTP client")?;

    match cli.command {
        Commands::Track { job_id } => {
            let result = pipeline
                .tracker()
                .track_with_progress(job_id, |update| println!("{}", render_update(update)))
                .await?;
            print_json(&result)?;
        }
        Commands::Upload { files } => {
            let summary = pipeline.api().upload_files(&files).await?;
            print_json(&summary)?;
        }
        Commands::Analyze { session_id } => {
            let result = pipeline.analyze(session_id, print_stage).await?;
            print_json(&result)?;
        }
        Commands::Extract {
            session_id,
            intention,
            schema,
        } => {
            let fields = match schema {
                Some(path) => Some(read_schema(&path).await?),
                None => None,
            };
            let outcome = pipeline
                .extract_and_index(session_id, &intention, fields.as_deref(), print_stage)
                .await?;
            print_json(&outcome)?;
        }
        Commands::Query {
            session_id,
            text,
            num_results,
        } => match pipeline
            .query(session_id, &text, num_results, print_stage)
            .await?
        {
            QueryOutcome::Answer(response) => {
                println!("{}", response.answer);
            }
            QueryOutcome::DynamicExtraction {
                response,
                result,
                data,
            } => {
                println!("{}", response.answer);
                print_json(&result)?;
                print_json(&data)?;
            }
        },
        Commands::Graph {
            session_id,
            text,
            num_results,
        } => {
            let outcome = pipeline
                .query(session_id, &text, num_results, print_stage)
                .await?;
            let graph = pipeline.graph(outcome.response()).await?;
            print_json(&graph)?;
        }
        Commands::Export { format, output } => {
            let bytes = pipeline.api().export_data(format.into()).await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &bytes)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    tracing::info!(path = %path.display(), bytes = bytes.len(), "Export written");
                }
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&bytes)?;
                }
            }
        }
        Commands::Health => {
            if !pipeline.api().health_check().await {
                bail!("Backend at {} is not healthy", config.api_base_url);
            }
            println!("ok");
        }
    }

    Ok(())
}

fn render_update(update: &JobUpdate) -> String {
    let line = format!("{:<10} {}", update.status, update.message);
    match update.timestamp_utc() {
        Some(at) if update.timestamp > 0.0 => format!("{} {line}", at.format("%H:%M:%S")),
        _ => line,
    }
}

async fn read_schema(path: &std::path::Path) -> anyhow::Result<Vec<SchemaField>> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read schema file {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("Invalid schema file {}", path.display()))
}

fn print_stage(stage: StageUpdate) {
    println!("[{}] {}", stage.stage, render_update(&stage.update));
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
