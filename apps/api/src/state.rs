use sqlx::PgPool;
use std::sync::Arc;

use crate::cache::TieredCache;
use crate::config::Config;
use crate::ingest::Orchestrator;
use crate::matcher::Matcher;
use crate::queue::JobQueue;
use crate::store::DocStore;

/// Shared application state injected into all route handlers via Axum
/// extractors. Adapters are built once in the composition root and passed
/// down; nothing here is a singleton.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<JobQueue>,
    pub orchestrator: Arc<Orchestrator>,
    pub matcher: Arc<Matcher>,
    pub store: Arc<DocStore>,
    pub cache: Arc<TieredCache>,
    pub config: Config,
}
