//! # Campus assistant CLI (`campus`)
//!
//! Builds and serves the document index behind the college assistant.
//!
//! ## Usage
//!
//! ```bash
//! campus --config ./config/campus.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `campus rebuild` | Reindex every document and atomically swap the index |
//! | `campus status` | Show the persisted index generation (read-only) |
//! | `campus search "<query>"` | Show the passages retrieved for a query |
//! | `campus ask "<query>"` | Answer a query end to end (may record an escalation) |
//! | `campus serve` | Start the HTTP server |
//! | `campus escalations list` | List escalated queries |
//! | `campus escalations update <id>` | Resolve an escalated query |
//!
//! Logs go to stderr (`RUST_LOG`, default `campus_rag=info`); command output
//! goes to stdout.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use campus_rag::assistant::Assistant;
use campus_rag::config::{self, Config};
use campus_rag::embedding::create_provider;
use campus_rag::error::IndexLoadError;
use campus_rag::escalation::{EscalationLog, SqliteEscalationLog};
use campus_rag::extract::ExtractorRegistry;
use campus_rag::index::persist::IndexStore;
use campus_rag::llm::create_language_model;
use campus_rag::models::{EscalationStatus, Query, Requester};
use campus_rag::policy::AnswerPolicy;
use campus_rag::rebuild::{BuildSettings, IndexManager};
use campus_rag::retriever::Retriever;
use campus_rag::server::{self, AppState};

/// Campus assistant: retrieval-augmented answers over college documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/campus.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "campus", version, about = "Retrieval-augmented college assistant")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/campus.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reindex every document under `[documents].root` and activate the result.
    ///
    /// The previous index stays active if any step fails.
    Rebuild,

    /// Show the persisted index generation. Never builds or writes anything.
    Status,

    /// Show the passages retrieved for a query, with scores.
    Search {
        query: String,
        /// Number of passages (defaults to `[retrieval].top_k`).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a query end to end.
    ///
    /// If the answer is the escalation message, the query is recorded in
    /// the escalation log.
    Ask {
        query: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Inspect and resolve escalated queries.
    Escalations {
        #[command(subcommand)]
        action: EscalationAction,
    },
}

#[derive(Subcommand)]
enum EscalationAction {
    /// List escalated queries as JSON, newest first.
    List {
        /// Only show `Initiated` or `Finished` records.
        #[arg(long)]
        status: Option<EscalationStatus>,
    },
    /// Set the status and remarks of one record.
    Update {
        id: i64,
        #[arg(long)]
        status: EscalationStatus,
        #[arg(long, default_value = "")]
        remarks: String,
    },
    /// Show initiated / finished counts.
    Stats,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("campus_rag=info,campus=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_index(cfg: &Config) -> anyhow::Result<Arc<IndexManager>> {
    let embedder = create_provider(&cfg.embedding)?;
    let manager = IndexManager::open(
        IndexStore::new(&cfg.index.dir),
        embedder,
        Arc::new(ExtractorRegistry::with_builtins()),
        BuildSettings::from_config(cfg),
        &cfg.documents.root,
    )
    .await
    .context("failed to open index")?;
    Ok(Arc::new(manager))
}

async fn open_escalations(cfg: &Config) -> anyhow::Result<Arc<dyn EscalationLog>> {
    let log = SqliteEscalationLog::open(&cfg.escalation.db_path)
        .await
        .with_context(|| format!("failed to open {}", cfg.escalation.db_path.display()))?;
    Ok(Arc::new(log))
}

async fn build_assistant(cfg: &Config, index: &IndexManager) -> anyhow::Result<Arc<Assistant>> {
    let llm = create_language_model(&cfg.llm)?;
    let retriever = Retriever::new(index.active(), index.embedder(), cfg.retrieval.top_k);
    let policy = AnswerPolicy::new(llm, retriever, cfg.policy.clone());
    let log = open_escalations(cfg).await?;
    Ok(Arc::new(Assistant::new(
        policy,
        log,
        cfg.escalation.utc_offset_minutes,
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Rebuild => {
            let index = IndexManager::open_for_rebuild(
                IndexStore::new(&cfg.index.dir),
                create_provider(&cfg.embedding)?,
                Arc::new(ExtractorRegistry::with_builtins()),
                BuildSettings::from_config(&cfg),
            )
            .await
            .context("failed to open index")?;
            let report = index.rebuild(&cfg.documents.root).await?;
            println!(
                "Rebuilt index {}: {} documents, {} passages ({} skipped files) in {} ms",
                report.generation_id,
                report.documents,
                report.passages,
                report.skipped_files,
                report.elapsed_ms
            );
        }
        Commands::Status => {
            let store = IndexStore::new(&cfg.index.dir);
            let status = match IndexManager::persisted_status(&store) {
                Ok(Some(status)) => status,
                Ok(None) | Err(IndexLoadError::NotFound(_)) => {
                    println!("No active index in {}.", store.dir().display());
                    println!("Run `campus rebuild` to build one.");
                    return Ok(());
                }
                Err(e) => return Err(e).context("failed to read index status"),
            };
            println!("Generation:  {}", status.generation_id);
            println!("Created:     {}", status.created_at.to_rfc3339());
            println!("Model:       {} ({} dims, {})", status.model, status.dims, status.metric);
            println!("Passages:    {}", status.passages);
            println!("Location:    {}", status.index_dir.display());
        }
        Commands::Search { query, limit } => {
            let index = open_index(&cfg).await?;
            let retriever = Retriever::new(index.active(), index.embedder(), cfg.retrieval.top_k);
            let results = retriever
                .search(&query, limit.unwrap_or(cfg.retrieval.top_k))
                .await?;
            if results.is_empty() {
                println!("No results.");
            }
            for (i, hit) in results.iter().enumerate() {
                let preview: String = hit.passage.text.chars().take(160).collect();
                println!(
                    "{}. [{:.3}] {} #{}",
                    i + 1,
                    hit.score,
                    hit.passage.source,
                    hit.passage.position
                );
                println!("   {}", preview.replace('\n', " "));
            }
        }
        Commands::Ask {
            query,
            name,
            email,
            phone,
        } => {
            let index = open_index(&cfg).await?;
            let assistant = build_assistant(&cfg, &index).await?;
            let query = Query {
                text: query,
                requester: Requester { name, email, phone },
            };
            let reply = assistant.handle(&query).await?;
            println!("{}", reply.answer);
            if let Some(id) = reply.escalation_id {
                eprintln!("Recorded escalation #{}", id);
            }
        }
        Commands::Serve => {
            let index = open_index(&cfg).await?;
            let assistant = build_assistant(&cfg, &index).await?;
            let state = AppState {
                assistant,
                index,
                documents_root: Arc::new(cfg.documents.root.clone()),
            };
            server::run_server(&cfg.server.bind, state).await?;
        }
        Commands::Escalations { action } => {
            let log = open_escalations(&cfg).await?;
            match action {
                EscalationAction::List { status } => {
                    let records = log.list(status).await?;
                    println!("{}", serde_json::to_string_pretty(&records)?);
                }
                EscalationAction::Update {
                    id,
                    status,
                    remarks,
                } => {
                    log.update_status(id, status, &remarks).await?;
                    println!("Escalation #{} marked {}", id, status);
                }
                EscalationAction::Stats => {
                    let stats = log.stats().await?;
                    println!("Initiated: {}", stats.initiated);
                    println!("Finished:  {}", stats.finished);
                }
            }
        }
    }

    Ok(())
}
