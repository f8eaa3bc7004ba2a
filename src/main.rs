//! # DocHarbor CLI (`harbor`)
//!
//! Command-line interface for the ingestion and retrieval pipeline.
//!
//! ## Usage
//!
//! ```bash
//! harbor --config ./config/harbor.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harbor init` | Create the SQLite database and run schema migrations |
//! | `harbor upload <project> <files...>` | Upload files and process them |
//! | `harbor list <project>` | List a project's files and their status |
//! | `harbor get <id>` | Show one file, optionally with extracted text |
//! | `harbor delete <id>` | Delete a file, its chunks, and stored bytes |
//! | `harbor retry <id>` | Re-process a failed file |
//! | `harbor status` | File counts by processing status |
//! | `harbor search "<query>"` | Hybrid similarity + keyword search |

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docharbor::config::{self, Config};
use docharbor::embedding;
use docharbor::files::{FileService, UploadRequest};
use docharbor::models::FileStatus;
use docharbor::queue::IngestionQueue;
use docharbor::search::{SearchOptions, SearchService};
use docharbor::store::VectorStore;
use docharbor::{db, migrate};

/// DocHarbor — a file ingestion and retrieval pipeline for project
/// documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/harbor.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "harbor",
    about = "DocHarbor — file ingestion and hybrid retrieval over project documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harbor.toml")]
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
    /// (project_files, chunks, chunks_fts). Idempotent — running it
    /// multiple times is safe.
    Init,

    /// Upload files to a project and process them.
    ///
    /// Files are validated (extension allow-list, size and count limits),
    /// stored, and driven through extraction, chunking, and embedding
    /// before the command returns. With `--no-wait` the records are
    /// created as `pending` and left unprocessed.
    Upload {
        /// Project the files belong to.
        project: String,

        /// Paths of the files to upload.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Create the records but skip processing.
        #[arg(long)]
        no_wait: bool,
    },

    /// List a project's files with status and chunk counts.
    List {
        /// Project identifier.
        project: String,
    },

    /// Show one file's metadata.
    Get {
        /// File UUID.
        id: String,

        /// Also print the cached extracted text.
        #[arg(long)]
        content: bool,
    },

    /// Delete a file: queue task, chunks, record, and stored bytes.
    Delete {
        /// File UUID.
        id: String,
    },

    /// Re-process a failed file at elevated priority.
    Retry {
        /// File UUID.
        id: String,
    },

    /// File counts by processing status.
    Status,

    /// Search indexed chunks.
    ///
    /// Combines vector similarity with keyword matches and recency
    /// weighting, and prints ranked chunks with surrounding context.
    Search {
        /// The search query string.
        query: String,

        /// Restrict results to one project.
        #[arg(long)]
        project: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum similarity score (0.0 - 1.0).
        #[arg(long)]
        threshold: Option<f64>,
    },
}

struct App {
    pool: sqlx::SqlitePool,
    files: FileService,
    search: SearchService,
    queue: IngestionQueue,
}

async fn build_app(config: &Config) -> anyhow::Result<App> {
    let pool = db::connect(&config.db.path)
        .await
        .with_context(|| format!("failed to open database at {}", config.db.path.display()))?;
    migrate::run_migrations(&pool).await?;

    let store = VectorStore::new(pool.clone());
    let embedder = embedding::create_embedder(&config.embedding)?;
    let queue = IngestionQueue::new(
        pool.clone(),
        store.clone(),
        embedder.clone(),
        config.queue.clone(),
        config.chunking.clone(),
    );
    let files = FileService::new(
        pool.clone(),
        store.clone(),
        queue.clone(),
        config.upload.clone(),
    );
    let search = SearchService::new(store, embedder, config.retrieval.clone());

    Ok(App {
        pool,
        files,
        search,
        queue,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized at {}", config.db.path.display());
        }

        Commands::Upload {
            project,
            paths,
            no_wait,
        } => {
            let app = build_app(&config).await?;

            let mut requests = Vec::with_capacity(paths.len());
            for path in &paths {
                let filename = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .with_context(|| format!("bad file name: {}", path.display()))?
                    .to_string();
                let bytes = std::fs::read(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                requests.push(UploadRequest { filename, bytes });
            }

            let created = app.files.upload(&project, requests).await?;
            for file in &created {
                println!("uploaded {}  {}", file.id, file.filename);
            }

            if !no_wait {
                app.queue.start();
                app.queue.drain().await;
                app.queue.shutdown().await;
                for file in &created {
                    let latest = app.files.get(&file.id).await?;
                    match latest.status {
                        FileStatus::Ready => {
                            println!("ready    {}  {} chunks", latest.id, latest.chunk_count)
                        }
                        FileStatus::Failed => println!(
                            "failed   {}  {}",
                            latest.id,
                            latest.last_error.unwrap_or_default()
                        ),
                        other => println!("{:<8} {}", other.as_str(), latest.id),
                    }
                }
            }
            app.pool.close().await;
        }

        Commands::List { project } => {
            let app = build_app(&config).await?;
            let files = app.files.list(&project).await?;
            if files.is_empty() {
                println!("No files in project '{project}'.");
            }
            for file in files {
                println!(
                    "{}  {:<10} {:>4} chunks  {}",
                    file.id,
                    file.status.as_str(),
                    file.chunk_count,
                    file.filename
                );
            }
            app.pool.close().await;
        }

        Commands::Get { id, content } => {
            let app = build_app(&config).await?;
            let (file, text) = app.files.get_with_content(&id).await?;
            println!("id:         {}", file.id);
            println!("project:    {}", file.project_id);
            println!("filename:   {}", file.filename);
            println!("size:       {} bytes", file.size_bytes);
            println!("status:     {}", file.status.as_str());
            println!("chunks:     {}", file.chunk_count);
            if let Some(err) = &file.last_error {
                println!("last error: {err}");
            }
            if content {
                match text {
                    Some(text) => println!("\n{text}"),
                    None => println!("\n(no extracted text yet)"),
                }
            }
            app.pool.close().await;
        }

        Commands::Delete { id } => {
            let app = build_app(&config).await?;
            app.files.delete(&id).await?;
            println!("deleted {id}");
            app.pool.close().await;
        }

        Commands::Retry { id } => {
            let app = build_app(&config).await?;
            app.queue.start();
            app.queue.retry(&id).await?;
            app.queue.drain().await;
            app.queue.shutdown().await;
            let file = app.files.get(&id).await?;
            println!("{}  {}", file.status.as_str(), file.id);
            app.pool.close().await;
        }

        Commands::Status => {
            let app = build_app(&config).await?;
            for status in ["pending", "processing", "ready", "failed"] {
                let count: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM project_files WHERE status = ?")
                        .bind(status)
                        .fetch_one(&app.pool)
                        .await?;
                println!("{status:<12} {count}");
            }
            app.pool.close().await;
        }

        Commands::Search {
            query,
            project,
            limit,
            threshold,
        } => {
            let app = build_app(&config).await?;
            let results = app
                .search
                .search(
                    &query,
                    SearchOptions {
                        project_id: project,
                        limit,
                        threshold,
                    },
                )
                .await?;

            if results.is_empty() {
                println!("No results.");
            }
            for (i, result) in results.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {} (sim {:.3} / text {:.1} / recency {:.2})",
                    i + 1,
                    result.score,
                    result.filename,
                    result.breakdown.similarity,
                    result.breakdown.text_match,
                    result.breakdown.recency
                );
                if let Some(before) = &result.context_before {
                    println!("   …{before}");
                }
                println!("   {}", result.text);
                if let Some(after) = &result.context_after {
                    println!("   {after}…");
                }
                println!();
            }
            app.pool.close().await;
        }
    }

    Ok(())
}
