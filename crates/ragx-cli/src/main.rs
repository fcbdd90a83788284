//! RAGX CLI - Command-line interface
//!
//! Usage:
//!   ragx ingest <path> [--id <doc-id>]
//!   ragx query <text> [--top-k <n>]
//!   ragx ask <question> [--top-k <n>]
//!   ragx remove <doc-id>
//!   ragx collection info
//!
//! Configuration comes from `--config <file>` (TOML) overridden by
//! environment variables.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use ragx_core::{AppConfig, Document, IngestionReport, LoggingConfig, StoreBackend};
use ragx_engine::{create_llm_client, IngestionQueue, RagPipeline, RetrievalEngine};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Snapshot used by the flat backend when none is configured
const DEFAULT_SNAPSHOT: &str = ".ragx/index.json";

/// File extensions picked up when ingesting a directory
const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "rst"];

#[derive(Parser)]
#[command(name = "ragx")]
#[command(about = "Embedding and retrieval engine CLI")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a text file, or every text file in a directory
    Ingest {
        /// Path to a file or directory
        path: PathBuf,

        /// Document ID (single file only; defaults to the file path)
        #[arg(long)]
        id: Option<String>,
    },
    /// Retrieve the passages most similar to a text
    Query {
        text: String,

        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Answer a question from retrieved passages
    Ask {
        question: String,

        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Remove every record of a document
    Remove {
        /// Document ID
        id: String,
    },
    /// Inspect the collection
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Show schema and record count
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    let engine = Arc::new(
        RetrievalEngine::from_config(&config)
            .await
            .context("failed to start retrieval engine")?,
    );

    let result = run(cli.command, cli.json, &config, &engine).await;

    if let Err(e) = engine.shutdown().await {
        warn!("Shutdown failed: {e}");
    }
    result
}

async fn run(
    command: Commands,
    json: bool,
    config: &AppConfig,
    engine: &Arc<RetrievalEngine>,
) -> anyhow::Result<()> {
    match command {
        Commands::Ingest { path, id } => {
            let documents = load_documents(&path, id)?;
            if documents.is_empty() {
                bail!("no text files found at {}", path.display());
            }

            let reports = ingest_all(engine, documents, config.ingestion.workers).await;
            let mut failed = 0;
            for report in &reports {
                match report {
                    Ok(report) => print_report(report, json)?,
                    Err(e) => {
                        failed += 1;
                        eprintln!("error: {e}");
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} documents failed", reports.len());
            }
        }
        Commands::Query { text, top_k } => {
            let top_k = top_k.unwrap_or(config.engine.top_k_default);
            let results = engine.query(&text, top_k).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else if results.is_empty() {
                println!("No results.");
            } else {
                for (i, r) in results.iter().enumerate() {
                    println!(
                        "{:>2}. [{:.4}] {} / {}",
                        i + 1,
                        r.score,
                        r.document_id,
                        r.chunk_id
                    );
                    println!("    {}", preview(&r.content, 160));
                }
            }
        }
        Commands::Ask { question, top_k } => {
            let top_k = top_k.unwrap_or(config.engine.top_k_default);
            let llm = create_llm_client(&config.llm)?;
            let pipeline = RagPipeline::new(Arc::clone(engine), llm, config.llm.max_context_chars);
            let answer = pipeline.answer(&question, top_k).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                println!("{}\n", answer.answer.trim());
                println!("Sources:");
                for (i, source) in answer.sources.iter().enumerate() {
                    println!("  [{}] {} / {}", i + 1, source.document_id, source.chunk_id);
                }
            }
        }
        Commands::Remove { id } => {
            let removed = engine.remove_document(&id).await?;
            println!("Removed {removed} records of '{id}'");
        }
        Commands::Collection {
            action: CollectionAction::Info,
        } => {
            let collection = &config.engine.collection_name;
            let store = engine.store();
            let info = CollectionInfo {
                backend: store.name().to_string(),
                name: collection.clone(),
                dimension: config.engine.embedding_dimension,
                metric: config.engine.similarity_metric.to_string(),
                records: store.count(collection).await?,
                fingerprint: engine.chunker().fingerprint().to_string(),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("Collection: {} ({})", info.name, info.backend);
                println!("  dimension:   {}", info.dimension);
                println!("  metric:      {}", info.metric);
                println!("  records:     {}", info.records);
                println!("  fingerprint: {}", info.fingerprint);
            }
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct CollectionInfo {
    backend: String,
    name: String,
    dimension: usize,
    metric: String,
    records: u64,
    fingerprint: String,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let mut config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };

    if config.store.backend == StoreBackend::Flat && config.store.snapshot_path.is_none() {
        config.store.snapshot_path = Some(PathBuf::from(DEFAULT_SNAPSHOT));
    }

    config.validate()?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);

    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_documents(path: &Path, id: Option<String>) -> anyhow::Result<Vec<Document>> {
    if path.is_file() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let id = id.unwrap_or_else(|| path.display().to_string());
        return Ok(vec![Document::new(id, text).with_path(path.display().to_string())]);
    }

    if id.is_some() {
        bail!("--id can only be used when ingesting a single file");
    }

    let mut files = Vec::new();
    collect_text_files(path, &mut files)?;
    files.sort();

    files
        .into_iter()
        .map(|file| {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let id = file.display().to_string();
            Ok(Document::new(id.clone(), text).with_path(id))
        })
        .collect()
}

fn collect_text_files(dir: &Path, files: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_text_files(&path, files)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| TEXT_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        {
            files.push(path);
        }
    }
    Ok(())
}

async fn ingest_all(
    engine: &Arc<RetrievalEngine>,
    documents: Vec<Document>,
    workers: usize,
) -> Vec<ragx_core::Result<IngestionReport>> {
    if documents.len() == 1 {
        let mut documents = documents;
        let document = documents.remove(0);
        return vec![engine.ingest_document(&document).await];
    }

    info!(documents = documents.len(), workers, "Ingesting documents");
    let queue = IngestionQueue::start(Arc::clone(engine), workers);

    let mut handles = Vec::with_capacity(documents.len());
    for document in documents {
        handles.push(queue.submit(document).await);
    }

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        reports.push(match handle {
            Ok(handle) => handle.wait().await,
            Err(e) => Err(e),
        });
    }

    queue.shutdown().await;
    reports
}

fn print_report(report: &IngestionReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
        return Ok(());
    }

    println!(
        "{}: {} ({}/{} chunks, {} superseded, {} ms)",
        report.document_id,
        report.state,
        report.succeeded.len(),
        report.total_chunks,
        report.records_superseded,
        report.elapsed_ms
    );
    for (chunk_id, reason) in &report.failed {
        println!("  failed {chunk_id}: {reason}");
    }
    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
