//! # docmirror CLI
//!
//! The `docmirror` binary drives crawling, the sync worker, search, and
//! trust-scored answers over the local documentation mirror.
//!
//! ## Usage
//!
//! ```bash
//! docmirror --config ./config/docmirror.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docmirror init` | Create the SQLite database and schema |
//! | `docmirror sources` | List configured sources with sync health |
//! | `docmirror sync <source\|all>` | Crawl and ingest in the foreground |
//! | `docmirror worker [--once]` | Run the queued sync worker pool |
//! | `docmirror search "<query>"` | Hybrid search over mirrored docs |
//! | `docmirror answer "<question>"` | Answer with citations and a decision envelope |
//! | `docmirror changes` | List detected documentation changes |
//!
//! Logs go to stderr and are filtered with `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docmirror::search::{AnswerOptions, SearchOptions};
use docmirror::sqlite_store::SqliteStore;
use docmirror::{changes, config, db, embedding, ingest, migrate, search, sources};

/// docmirror: a change-aware mirror of third-party developer docs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docmirror.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docmirror",
    about = "docmirror: a change-aware mirror of third-party developer documentation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docmirror.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and every table. Safe to run
    /// repeatedly.
    Init,

    /// List configured sources and their sync health.
    Sources,

    /// Crawl and ingest a source now.
    Sync {
        /// Source id, or `all` for every configured source.
        source: String,
    },

    /// Run the sync worker pool.
    ///
    /// Enqueues sources whose last sync is older than their poll interval
    /// and processes queued sync requests until interrupted.
    Worker {
        /// Process what is due now, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Search mirrored documentation.
    Search {
        /// The search query string.
        query: String,

        /// Restrict to a source id. Repeatable.
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Version tag (`latest` matches untagged pages).
        #[arg(long)]
        version: Option<String>,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Answer a question from mirrored documentation.
    ///
    /// Prints the answer, citations, freshness, warnings, and the decision
    /// envelope as JSON.
    Answer {
        /// The question.
        question: String,

        /// Apply a tenant's source policy.
        #[arg(long)]
        tenant: Option<String>,

        /// Restrict to a source id. Repeatable.
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Prefix the source and append a grounding note.
        #[arg(long)]
        detailed: bool,
    },

    /// List detected change events, newest first.
    Changes {
        #[arg(long)]
        source: Option<String>,

        /// `document_added`, `updated`, `deprecation`, or `breaking_change`.
        #[arg(long)]
        event_type: Option<String>,

        /// `low`, `medium`, `high`, or `critical`.
        #[arg(long)]
        severity: Option<String>,

        #[arg(long)]
        limit: Option<i64>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            let pool = db::connect(&cfg).await?;
            let store = SqliteStore::new(pool.clone());
            sources::list_sources(&cfg, &store).await?;
            pool.close().await;
        }
        Commands::Sync { source } => {
            ingest::run_sync(&cfg, &source).await?;
        }
        Commands::Worker { once } => {
            ingest::run_worker_command(&cfg, once).await?;
        }
        Commands::Search {
            query,
            sources,
            version,
            limit,
        } => {
            let pool = db::connect(&cfg).await?;
            let store = SqliteStore::new(pool.clone());
            let embedder = embedding::create_embedder(&cfg.embedding)?;
            let options = SearchOptions {
                sources,
                version,
                limit,
            };
            search::run_search(&cfg, &store, embedder.as_deref(), &query, &options).await?;
            pool.close().await;
        }
        Commands::Answer {
            question,
            tenant,
            sources,
            detailed,
        } => {
            let pool = db::connect(&cfg).await?;
            let store = SqliteStore::new(pool.clone());
            let embedder = embedding::create_embedder(&cfg.embedding)?;
            let options = AnswerOptions {
                tenant,
                sources,
                detailed,
            };
            search::run_answer(&cfg, &store, embedder.as_deref(), &question, &options).await?;
            pool.close().await;
        }
        Commands::Changes {
            source,
            event_type,
            severity,
            limit,
        } => {
            let filter = changes::change_filter(
                source.as_deref(),
                event_type.as_deref(),
                severity.as_deref(),
                limit,
            )?;
            let pool = db::connect(&cfg).await?;
            let store = SqliteStore::new(pool.clone());
            changes::run_changes(&store, &filter).await?;
            pool.close().await;
        }
    }

    Ok(())
}
