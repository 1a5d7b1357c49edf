//! # Findex CLI (`findex`)
//!
//! The `findex` binary is the interface to the document classification
//! pipeline: database initialization, document submission, workers,
//! status inspection, and search.
//!
//! ## Usage
//!
//! ```bash
//! findex --config ./config/findex.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `findex init` | Create the SQLite database and run schema migrations |
//! | `findex submit <file>` | Hash, store, and enqueue a document |
//! | `findex worker` | Run the worker pool until interrupted |
//! | `findex status [hash-or-task]` | Queue depth, or one document's tasks |
//! | `findex result <hash>` | Classification result and history |
//! | `findex search "<query>"` | Keyword search over indexed documents |
//! | `findex requeue <hash>` | New task for a document whose run failed |
//! | `findex cancel <task>` | Request cancellation of an in-flight task |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use findex::models::{ts_to_datetime, DocumentFormat};
use findex::pipeline::Pipeline;
use findex::{config, db, ingest, migrate, search, store, worker};

/// Findex CLI — a financial document classification and indexing pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/findex.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "findex",
    about = "Findex — a financial document classification and indexing pipeline",
    version,
    long_about = "Findex ingests PDF, DOCX, and HTML documents, classifies them into a closed \
    category set with a versioned model, and indexes them for keyword search. Processing runs \
    through a durable task queue with retries, backoff, and content-addressed caching."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/findex.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, tasks, classifications, queue, index_entries,
    /// search_fts). This command is idempotent.
    Init,

    /// Submit a document for processing.
    ///
    /// Hashes the file, stores the blob, creates a task, and enqueues it.
    /// Submitting byte-identical content again coalesces onto the existing
    /// task or completes immediately from stored results.
    Submit {
        /// Path to the document (pdf, docx, or html).
        file: PathBuf,

        /// Declared format, overriding extension and content sniffing.
        #[arg(long)]
        format: Option<String>,

        /// Process in this process instead of waiting for a worker.
        #[arg(long)]
        inline: bool,
    },

    /// Run the worker pool.
    ///
    /// Polls the queue and drives tasks through
    /// parse → extract → classify → index. Ctrl-C stops the pool after
    /// in-flight work finishes.
    Worker {
        /// Exit once the queue is empty instead of idling.
        #[arg(long)]
        drain: bool,

        /// Override the configured worker count.
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Show system status, or the status of one document or task.
    Status {
        /// Content hash or task id. Omit for a system-wide summary.
        target: Option<String>,
    },

    /// Show a document's classification result and history.
    Result {
        /// Content hash of the document.
        content_hash: String,
    },

    /// Search indexed documents.
    Search {
        /// The search query string.
        query: String,

        /// Restrict results to one category
        /// (financial-report, contract, invoice, other).
        #[arg(long)]
        category: Option<String>,

        /// Maximum number of results to return.
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Create a fresh task for a document whose previous run failed.
    Requeue {
        /// Content hash of the document.
        content_hash: String,
    },

    /// Request cancellation of an in-flight task.
    ///
    /// The cancel flag is honored at the next stage boundary; a stage
    /// that already started runs to completion.
    Cancel {
        /// Task id.
        task_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("findex=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Submit {
            file,
            format,
            inline,
        } => {
            let declared = match format.as_deref() {
                Some(s) => Some(
                    DocumentFormat::from_str_opt(s)
                        .ok_or_else(|| anyhow::anyhow!("unknown format '{}'", s))?,
                ),
                None => None,
            };
            let pool = db::connect(&cfg).await?;
            let outcome = ingest::submit(&pool, &cfg, &file, declared).await?;
            match &outcome {
                ingest::SubmitOutcome::Enqueued {
                    content_hash,
                    task_id,
                } => {
                    println!("Enqueued: {}", content_hash);
                    println!("Task:     {}", task_id);
                }
                ingest::SubmitOutcome::Coalesced {
                    content_hash,
                    task_id,
                } => {
                    println!("Already in flight: {}", content_hash);
                    println!("Task:              {}", task_id);
                }
                ingest::SubmitOutcome::AlreadyComplete { content_hash } => {
                    println!("Already indexed: {}", content_hash);
                }
            }
            let already_complete =
                matches!(&outcome, ingest::SubmitOutcome::AlreadyComplete { .. });
            if inline && !already_complete {
                let pipeline = Arc::new(Pipeline::from_config(pool.clone(), &cfg));
                let result = ingest::process_inline(pipeline, outcome.content_hash()).await?;
                println!("Inline outcome: {:?}", result);
            }
            pool.close().await;
        }
        Commands::Worker { drain, workers } => {
            let mut cfg = cfg;
            if let Some(n) = workers {
                cfg.pipeline.workers = n.max(1);
            }
            let pool = db::connect(&cfg).await?;
            let pipeline = Arc::new(Pipeline::from_config(pool.clone(), &cfg));
            worker::run_workers(pipeline, &cfg.pipeline, drain).await?;
            pool.close().await;
        }
        Commands::Status { target } => {
            let pool = db::connect(&cfg).await?;
            match target {
                None => {
                    let status = search::system_status(&pool).await?;
                    println!("Documents:        {}", status.documents);
                    println!("Pending messages: {}", status.pending_messages);
                    println!("Tasks by stage:");
                    for (stage, count) in &status.tasks_by_stage {
                        println!("  {:<12} {}", stage, count);
                    }
                }
                Some(target) => {
                    // Try the target as a task id first, then as a content hash
                    if let Some((task, report)) = search::task_report(&pool, &target).await? {
                        print_task(&task);
                        print_report(&report);
                    } else if let Some(report) = search::document_report(&pool, &target).await? {
                        print_report(&report);
                    } else {
                        println!("No task or document found for {}", target);
                    }
                }
            }
            pool.close().await;
        }
        Commands::Result { content_hash } => {
            let pool = db::connect(&cfg).await?;
            match store::get_classification(
                &pool,
                &content_hash,
                &cfg.features.version,
                &cfg.model.version,
            )
            .await?
            {
                Some(result) => {
                    println!("Label:        {}", result.label);
                    println!("Confidence:   {:.4}", result.confidence);
                    println!("Needs review: {}", result.needs_review);
                    println!(
                        "Classified:   {} (features {}, model {})",
                        ts_to_datetime(result.classified_at)
                            .map(|d| d.to_rfc3339())
                            .unwrap_or_default(),
                        result.feature_version,
                        result.model_version
                    );
                }
                None => println!(
                    "No result for {} under features {} / model {}",
                    content_hash, cfg.features.version, cfg.model.version
                ),
            }
            let history = store::classification_history(&pool, &content_hash).await?;
            if history.len() > 1 {
                println!("History:");
                for c in &history {
                    println!(
                        "  {} / {}: {} ({:.4})",
                        c.feature_version, c.model_version, c.label, c.confidence
                    );
                }
            }
            pool.close().await;
        }
        Commands::Search {
            query,
            category,
            limit,
        } => {
            let pool = db::connect(&cfg).await?;
            let indexer = findex::index::SqliteIndexer::new(pool.clone());
            let request = search::SearchRequest {
                query,
                category: category.as_deref().map(search::parse_category).transpose()?,
                limit,
            };
            let hits = search::run_search(&indexer, &request).await?;
            if hits.is_empty() {
                println!("No results.");
            } else {
                for (i, hit) in hits.iter().enumerate() {
                    println!(
                        "{}. [{}] {} (confidence {:.2})",
                        i + 1,
                        hit.label,
                        hit.content_hash,
                        hit.confidence
                    );
                    println!("   {}", hit.snippet);
                }
            }
            pool.close().await;
        }
        Commands::Requeue { content_hash } => {
            let pool = db::connect(&cfg).await?;
            let task_id = ingest::requeue(&pool, &cfg, &content_hash).await?;
            println!("Requeued as task {}", task_id);
            pool.close().await;
        }
        Commands::Cancel { task_id } => {
            let pool = db::connect(&cfg).await?;
            if store::request_cancel(&pool, &task_id).await? {
                println!("Cancellation requested for {}", task_id);
            } else {
                println!("Task {} is not in flight.", task_id);
            }
            pool.close().await;
        }
    }

    Ok(())
}

fn print_task(task: &findex::models::Task) {
    println!("Task:      {}", task.task_id);
    println!("Stage:     {}", task.current_stage);
    if let Some(err) = &task.last_error {
        println!("Last err:  {}", err);
    }
    let attempts: Vec<String> = task
        .attempt_counts
        .iter()
        .map(|(stage, n)| format!("{}={}", stage, n))
        .collect();
    if !attempts.is_empty() {
        println!("Attempts:  {}", attempts.join(" "));
    }
}

fn print_report(report: &findex::search::DocumentReport) {
    println!("Document:  {}", report.document.content_hash);
    println!("Format:    {}", report.document.format);
    println!("Size:      {} bytes", report.document.size_bytes);
    if let Some(name) = &report.document.original_filename {
        println!("Filename:  {}", name);
    }
    println!("Indexed:   {}", report.indexed);
    if !report.tasks.is_empty() {
        println!("Tasks:");
        for t in &report.tasks {
            println!("  {} {}", t.task_id, t.current_stage);
        }
    }
    if !report.classifications.is_empty() {
        println!("Classifications:");
        for c in &report.classifications {
            println!(
                "  {} / {}: {} ({:.4}{})",
                c.feature_version,
                c.model_version,
                c.label,
                c.confidence,
                if c.needs_review { ", needs review" } else { "" }
            );
        }
    }
}
