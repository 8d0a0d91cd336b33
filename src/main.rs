//! # thread-triage CLI (`triage`)
//!
//! The `triage` binary is the primary interface for thread-triage. It
//! provides commands for database initialization, message ingestion,
//! embedding management, index building, thread labeling, querying, and
//! starting the review server.
//!
//! ## Usage
//!
//! ```bash
//! triage --config ./config/triage.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `triage init` | Create the SQLite database and run schema migrations |
//! | `triage sync rooms` | Ingest messages from the configured rooms |
//! | `triage sync archive --file <path>` | Ingest a local JSON export |
//! | `triage embed pending` | Backfill missing or stale embeddings |
//! | `triage embed rebuild` | Delete and regenerate all embeddings |
//! | `triage embed normalize` | Rescale stored vectors to unit length |
//! | `triage index build` | Build and persist the similarity index |
//! | `triage index verify` | Self-check the persisted index |
//! | `triage label run` | Classify unlabeled threads until done |
//! | `triage query "<text>"` | Ask the query assistant |
//! | `triage stats` | Database and labeling overview |
//! | `triage serve` | Start the review HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use thread_triage::{assistant, config, embed_cmd, index, ingest, labeler, migrate, server, stats};

/// thread-triage CLI — chat thread labeling, review, and answer retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/triage.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "triage",
    about = "thread-triage — chat thread labeling, review, and answer retrieval",
    version,
    long_about = "thread-triage ingests chat messages from a rooms-style messaging API, \
    labels conversation threads with an external LLM classifier, builds a similarity index \
    over thread-root embeddings, and serves a review API plus a query assistant."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/triage.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (spaces,
    /// messages, embeddings, thread_labels, checkpoints). Idempotent.
    Init,

    /// Ingest messages from a connector.
    ///
    /// `rooms` pulls every configured room from the messaging API
    /// (incremental via checkpoints); `archive` loads a local JSON export
    /// through the same pipeline.
    Sync {
        /// Connector: `rooms` or `archive`.
        connector: String,

        /// Restrict `rooms` to a single room id.
        #[arg(long)]
        room: Option<String>,

        /// Ignore checkpoints — refetch all messages from scratch.
        #[arg(long)]
        full: bool,

        /// Path to the JSON export (required for `archive`).
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Manage embedding vectors.
    ///
    /// Requires an embedding provider (e.g., OpenAI) to be configured.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Manage the similarity index artifact.
    Index {
        #[command(subcommand)]
        action: IndexAction,
    },

    /// Run the thread labeling job.
    Label {
        #[command(subcommand)]
        action: LabelAction,
    },

    /// Ask the query assistant.
    ///
    /// Embeds the query, finds the nearest previously answered thread, and
    /// optionally rephrases the stored answer through the LLM.
    Query {
        /// The question to answer.
        query: String,

        /// Override the number of index candidates to consider.
        #[arg(long)]
        top_k: Option<usize>,

        /// Return the stored answer verbatim, skipping the LLM rephrase.
        #[arg(long)]
        no_rephrase: bool,
    },

    /// Show database, embedding, and labeling statistics.
    Stats,

    /// Start the review HTTP server.
    ///
    /// Serves the thread/label review API and UI on `[server].bind`, with
    /// the similarity index loaded once at startup.
    Serve,
}

/// Embedding management subcommands.
#[derive(Subcommand)]
enum EmbedAction {
    /// Embed messages that are missing or have stale embeddings.
    Pending {
        /// Maximum number of messages to embed in this run.
        #[arg(long)]
        limit: Option<usize>,

        /// Override the batch size from config (texts per API call).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without performing any embedding.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate all embeddings.
    ///
    /// Useful when switching embedding models or dimensions. Rebuild the
    /// similarity index afterwards.
    Rebuild {
        /// Override the batch size from config (texts per API call).
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Rescale every stored vector to unit length.
    Normalize,
}

/// Index management subcommands.
#[derive(Subcommand)]
enum IndexAction {
    /// Build the index from thread-root embeddings and persist it.
    Build,
    /// Self-query every stored vector and report drift.
    Verify,
}

/// Labeling subcommands.
#[derive(Subcommand)]
enum LabelAction {
    /// Poll for unlabeled threads and classify them batch by batch.
    Run {
        /// Process a single batch and exit.
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync {
            connector,
            room,
            full,
            file,
        } => match connector.as_str() {
            "rooms" => {
                ingest::run_sync_rooms(&cfg, room.as_deref(), full).await?;
            }
            "archive" => {
                let path = file
                    .ok_or_else(|| anyhow::anyhow!("sync archive requires --file <path>"))?;
                ingest::run_sync_archive(&cfg, &path).await?;
            }
            other => {
                anyhow::bail!("Unknown connector: '{}'. Available: rooms, archive", other);
            }
        },
        Commands::Embed { action } => match action {
            EmbedAction::Pending {
                limit,
                batch_size,
                dry_run,
            } => {
                embed_cmd::run_embed_pending(&cfg, limit, batch_size, dry_run).await?;
            }
            EmbedAction::Rebuild { batch_size } => {
                embed_cmd::run_embed_rebuild(&cfg, batch_size).await?;
            }
            EmbedAction::Normalize => {
                embed_cmd::run_embed_normalize(&cfg).await?;
            }
        },
        Commands::Index { action } => match action {
            IndexAction::Build => {
                index::run_index_build(&cfg).await?;
            }
            IndexAction::Verify => {
                index::run_index_verify(&cfg).await?;
            }
        },
        Commands::Label { action } => match action {
            LabelAction::Run { once } => {
                labeler::run_labeler(&cfg, once).await?;
            }
        },
        Commands::Query {
            query,
            top_k,
            no_rephrase,
        } => {
            assistant::run_query(&cfg, &query, top_k, no_rephrase).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
