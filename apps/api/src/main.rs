mod cache;
mod config;
mod cpu_pool;
mod db;
mod embedding;
mod errors;
mod extraction;
mod ingest;
mod llm_client;
mod mail;
mod matcher;
mod models;
mod object_store;
mod parser;
mod queue;
mod routes;
mod state;
mod store;

use anyhow::Context;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cache::{RedisCache, TieredCache};
use crate::config::Config;
use crate::cpu_pool::CpuPool;
use crate::db::{create_pool, ensure_schema};
use crate::embedding::{DocEmbedder, HttpEmbedder};
use crate::extraction::Extractor;
use crate::ingest::Orchestrator;
use crate::llm_client::LlmClient;
use crate::mail::poller::{MailPoller, PgPostingDirectory, ProcessedSet};
use crate::mail::{ImapConfig, ImapMailbox};
use crate::matcher::{CategoryTable, Matcher};
use crate::object_store::S3Store;
use crate::parser::Parser;
use crate::queue::{JobQueue, Supervisor};
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::qdrant::QdrantStore;
use crate::store::DocStore;

/// Startup failures mapped to process exit codes:
/// 2 config error, 3 dependency unavailable, 4 fatal internal error.
enum StartupError {
    Config(anyhow::Error),
    Dependency(anyhow::Error),
    Fatal(anyhow::Error),
}

impl StartupError {
    fn code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 2,
            StartupError::Dependency(_) => 3,
            StartupError::Fatal(_) => 4,
        }
    }

    fn message(&self) -> &anyhow::Error {
        match self {
            StartupError::Config(e) | StartupError::Dependency(e) | StartupError::Fatal(e) => e,
        }
    }
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(()) => {}
        Err(e) => {
            error!("Startup failed: {:#}", e.message());
            eprintln!("talentum: {:#}", e.message());
            std::process::exit(e.code());
        }
    }
}

async fn run() -> Result<(), StartupError> {
    // Load configuration first; everything else depends on it.
    let config = Config::from_env().map_err(StartupError::Config)?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Talentum API v{}", env!("CARGO_PKG_VERSION"));

    let categories = match &config.category_incompatible {
        Some(raw) => CategoryTable::from_json(raw)
            .map_err(|e| StartupError::Config(anyhow::anyhow!(e.to_string())))?,
        None => CategoryTable::default_table(),
    };

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data dir {}", config.data_dir.display()))
        .map_err(StartupError::Config)?;

    // Initialize PostgreSQL
    let pool = create_pool(&config.database_url)
        .await
        .map_err(StartupError::Dependency)?;
    ensure_schema(&pool)
        .await
        .map_err(|e| StartupError::Dependency(anyhow::anyhow!(e.to_string())))?;

    // Initialize Redis (shared cache tier)
    let redis = redis::Client::open(config.redis_url.clone())
        .map_err(|e| StartupError::Dependency(anyhow::anyhow!("redis: {e}")))?;
    let cache = Arc::new(TieredCache::new(Some(Arc::new(RedisCache::new(redis)))));
    info!("Cache tiers initialized");

    // Initialize the vector store
    let qdrant = Arc::new(QdrantStore::new(config.qdrant_url.clone()));
    qdrant
        .ensure_collections()
        .await
        .map_err(|e| StartupError::Dependency(anyhow::anyhow!(e.to_string())))?;
    let store = Arc::new(DocStore::new(qdrant));
    info!("Vector store collections ready");

    // Initialize S3 / MinIO
    let s3 = build_s3_client(&config).await;
    let blobs = Arc::new(S3Store::new(s3, config.s3_bucket.clone()));
    info!("Object store client initialized");

    // Initialize the LLM client and embedder
    let llm = Arc::new(LlmClient::new(config.anthropic_api_key.clone()));
    info!("LLM client initialized (model: {})", llm_client::MODEL);
    let embedder = Arc::new(DocEmbedder::new(
        Arc::new(HttpEmbedder::new(
            config.embedder_url.clone(),
            config.embedder_model.clone(),
            config.embedder_api_key.clone(),
        )),
        cache.clone(),
    ));

    let cpu_pool = Arc::new(CpuPool::with_default_size());
    let extractor = Arc::new(Extractor::new(llm, cache.clone()));
    let matcher = Arc::new(Matcher::new(
        store.clone(),
        cache.clone(),
        cpu_pool.clone(),
        config.match_weights.clone(),
        categories,
        config.match_timeout,
    ));

    // Queue with durable submissions; restore whatever survived a restart.
    let queue = Arc::new(JobQueue::new(config.queue.clone(), Some(pool.clone())));
    queue
        .restore_persisted()
        .await
        .map_err(|e| StartupError::Dependency(anyhow::anyhow!(e.to_string())))?;

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(Parser::default()),
        extractor,
        embedder,
        store.clone(),
        blobs.clone(),
        matcher.clone(),
        cpu_pool,
        Some(pool.clone()),
    ));

    // Background services share one shutdown token.
    let shutdown = CancellationToken::new();

    let supervisor = Supervisor::new(queue.clone(), orchestrator.clone(), config.scaling.clone());
    let supervisor_handle = tokio::spawn(supervisor.run(shutdown.clone()));

    let poller_handle = match &config.mail {
        Some(mail) => {
            let processed = ProcessedSet::open(&config.data_dir.join("processed_emails.log"))
                .map_err(|e| StartupError::Config(anyhow::anyhow!(e.to_string())))?;
            let poller = MailPoller::new(
                Arc::new(ImapMailbox::new(ImapConfig {
                    host: mail.host.clone(),
                    port: mail.port,
                    username: mail.username.clone(),
                    password: mail.password.clone(),
                    folder: mail.folder.clone(),
                })),
                Arc::new(PgPostingDirectory::new(pool.clone())),
                queue.clone(),
                blobs,
                processed,
                mail.poll_interval,
                config.data_dir.join("poller.lock"),
            );
            Some(tokio::spawn(poller.run(shutdown.clone())))
        }
        None => {
            info!("IMAP_HOST not set, mail ingestion disabled");
            None
        }
    };

    // Build app state and router
    let state = AppState {
        db: pool,
        queue,
        orchestrator,
        matcher,
        store,
        cache,
        config: config.clone(),
    };
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: tighten CORS in production

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .map_err(|e| StartupError::Config(anyhow::anyhow!("bad PORT: {e}")))?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| StartupError::Dependency(anyhow::anyhow!("bind {addr}: {e}")))?;

    let serve_shutdown = shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            serve_shutdown.cancel();
        })
        .await;

    // Drain background services before reporting the outcome.
    shutdown.cancel();
    let _ = supervisor_handle.await;
    if let Some(handle) = poller_handle {
        let _ = handle.await;
    }

    result.map_err(|e| StartupError::Fatal(anyhow::anyhow!(e)))
}

/// Constructs an S3 client configured for MinIO (local) or AWS
/// (production).
async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "talentum-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.s3_endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}
