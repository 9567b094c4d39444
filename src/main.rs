use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rephole::blob_store::PgBlobStore;
use rephole::chunker::Chunker;
use rephole::config::Config;
use rephole::embedding::OpenAiEmbedder;
use rephole::producer::{IngestRequest, Producer};
use rephole::query::QueryService;
use rephole::queue::PgJobQueue;
use rephole::retriever::Retriever;
use rephole::server::{self, AppState};
use rephole::state_store::PgStateStore;
use rephole::traits::{Embedder, JobQueue, ParentStore, StateStore, VectorIndex};
use rephole::vector_store::ChromaStore;
use rephole::worker::IngestionWorker;
use rephole::{db, memory, migrate};

/// Semantic code-search backend: incremental Git ingestion, syntax-aware
/// chunking, and parent–child retrieval.
#[derive(Parser)]
#[command(name = "rephole", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema. Idempotent.
    Migrate,

    /// Start the HTTP API (ingestion producer + query service).
    Serve,

    /// Start an ingestion worker (queue consumer).
    Worker,

    /// Enqueue an ingestion job without going through the HTTP API.
    Ingest {
        /// Repository URL (https, ending in .git or on a known git host).
        #[arg(long)]
        url: String,

        /// Git ref to ingest. Defaults to `main`.
        #[arg(long = "ref")]
        git_ref: Option<String>,

        /// Client-facing repository id; derived from the URL when omitted.
        #[arg(long)]
        repo_id: Option<String>,

        /// Access token for private repositories.
        #[arg(long)]
        token: Option<String>,

        /// User id recorded in chunk metadata.
        #[arg(long)]
        user_id: Option<String>,

        /// Extra metadata as `key=value` pairs, attached to every record.
        #[arg(long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Migrate => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            println!("database schema is up to date");
        }
        Commands::Serve => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;

            let queue: Arc<dyn JobQueue> =
                Arc::new(PgJobQueue::new(pool.clone(), config.queue.clone()));
            let blobs: Arc<dyn ParentStore> = Arc::new(PgBlobStore::new(pool));
            let index: Arc<dyn VectorIndex> = Arc::new(ChromaStore::new(
                config.chroma.clone(),
                config.vector_store_batch_size,
            ));
            let embedder: Arc<dyn Embedder> =
                Arc::new(OpenAiEmbedder::new(config.embedding.clone())?);

            let state = AppState {
                producer: Arc::new(Producer::new(Arc::clone(&queue))),
                queue,
                query: Arc::new(QueryService::new(embedder, Retriever::new(index, blobs))),
            };
            server::run_server(state, config.api_port()).await?;
        }
        Commands::Worker => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;

            let chunker = Arc::new(Chunker::new());
            if chunker.languages().is_empty() {
                bail!("no language grammar loaded; refusing to start the worker");
            }

            let state_store: Arc<dyn StateStore> = Arc::new(PgStateStore::new(pool.clone()));
            let blobs: Arc<dyn ParentStore> = Arc::new(PgBlobStore::new(pool.clone()));
            let index: Arc<dyn VectorIndex> = Arc::new(ChromaStore::new(
                config.chroma.clone(),
                config.vector_store_batch_size,
            ));
            let embedder: Arc<dyn Embedder> =
                Arc::new(OpenAiEmbedder::new(config.embedding.clone())?);
            let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool, config.queue.clone()));

            if config.memory_monitoring {
                memory::spawn_monitor(config.memory_warn_mb);
            }

            let health_port = config.worker_port();
            tokio::spawn(async move {
                if let Err(e) = server::run_health_server(health_port).await {
                    tracing::error!(error = %e, "worker health endpoint failed");
                }
            });

            let shutdown = Arc::new(AtomicBool::new(false));
            let shutdown_signal = Arc::clone(&shutdown);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("ctrl-c received, finishing the in-flight job");
                    shutdown_signal.store(true, Ordering::Relaxed);
                }
            });

            let worker = IngestionWorker::new(
                state_store,
                blobs,
                index,
                embedder,
                queue,
                chunker,
                config.local_storage_path.clone(),
                Duration::from_millis(config.queue.poll_interval_ms),
            );
            worker.run(shutdown).await;
        }
        Commands::Ingest {
            url,
            git_ref,
            repo_id,
            token,
            user_id,
            meta,
        } => {
            let pool = db::connect(&config).await?;
            migrate::run_migrations(&pool).await?;
            let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(pool, config.queue.clone()));
            let producer = Producer::new(queue);

            let meta_map = if meta.is_empty() {
                None
            } else {
                Some(
                    meta.into_iter()
                        .map(|(k, v)| (k, serde_json::Value::String(v)))
                        .collect(),
                )
            };

            let request = IngestRequest {
                repo_url: url,
                git_ref,
                token,
                user_id,
                repo_id,
                meta: meta_map,
            };
            let (job_id, payload) = match producer.enqueue(request).await {
                Ok(queued) => queued,
                Err(rephole::producer::ProducerError::Validation(msg)) => {
                    bail!("invalid request: {msg}")
                }
                Err(rephole::producer::ProducerError::Internal(err)) => {
                    return Err(err.context("failed to enqueue ingestion job"))
                }
            };

            println!("queued job {job_id}");
            println!("  repo:   {}", payload.repo_url);
            println!("  ref:    {}", payload.git_ref);
            println!("  repoId: {}", payload.repo_id);
        }
    }

    Ok(())
}
