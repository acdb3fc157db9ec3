//! Matcher: loads the two record pairs by id, scores them on the CPU pool,
//! and caches the result. Request flow per match:
//! requested → loaded → scored → cached → returned, where a missing record
//! short-circuits to `NotScorable` instead of fabricating a score.

pub mod category;
pub mod score;

pub use category::CategoryTable;
pub use score::{compute_score, experience_score, rank_bulk, MatchWeights, Score};

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{match_key, TieredCache, MATCH_TTL};
use crate::cpu_pool::CpuPool;
use crate::errors::AppError;
use crate::models::DocumentKind;
use crate::store::DocStore;

/// A document's record pair held in memory for repeated scoring.
#[derive(Debug, Clone)]
pub struct LoadedDoc {
    pub structured: crate::models::Structured,
    pub embeddings: crate::models::EmbeddingsRecord,
}

pub struct Matcher {
    store: Arc<DocStore>,
    cache: Arc<TieredCache>,
    cpu_pool: Arc<CpuPool>,
    weights: MatchWeights,
    categories: CategoryTable,
    timeout: Duration,
}

impl Matcher {
    pub fn new(
        store: Arc<DocStore>,
        cache: Arc<TieredCache>,
        cpu_pool: Arc<CpuPool>,
        weights: MatchWeights,
        categories: CategoryTable,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            cpu_pool,
            weights,
            categories,
            timeout,
        }
    }

    pub fn weights_version(&self) -> &str {
        &self.weights.version
    }

    /// `Match(jd_id, cv_id) → Score` with the 5 s end-to-end deadline.
    pub async fn match_pair(&self, jd_id: Uuid, cv_id: Uuid) -> Result<Score, AppError> {
        tokio::time::timeout(self.timeout, async {
            let jd = self.load_jd(jd_id).await?;
            self.match_with_loaded_jd(jd_id, &jd, cv_id).await
        })
        .await
        .map_err(|_| AppError::DeadlineExceeded)?
    }

    /// Loads the JD record pair once, for bulk fan-out.
    pub async fn load_jd(&self, jd_id: Uuid) -> Result<LoadedDoc, AppError> {
        let structured = self
            .store
            .get_structured(DocumentKind::Jd, jd_id)
            .await?
            .ok_or(AppError::MissingEmbeddings(jd_id))?;
        let embeddings = self
            .store
            .get_embeddings(DocumentKind::Jd, jd_id)
            .await?
            .ok_or(AppError::MissingEmbeddings(jd_id))?;
        Ok(LoadedDoc {
            structured,
            embeddings,
        })
    }

    /// Scores one CV against an already-loaded JD. Each bulk sub-task only
    /// fetches the CV side.
    pub async fn match_with_loaded_jd(
        &self,
        jd_id: Uuid,
        jd: &LoadedDoc,
        cv_id: Uuid,
    ) -> Result<Score, AppError> {
        let key = match_key(&jd_id, &cv_id, &self.weights.version);
        if let Some(cached) = self.cache.get_json::<Score>(&key).await {
            debug!("Match cache hit for {jd_id}/{cv_id}");
            return Ok(cached);
        }

        // loaded
        let cv = self
            .store
            .get_structured(DocumentKind::Cv, cv_id)
            .await?
            .ok_or(AppError::MissingEmbeddings(cv_id))?;
        let cv_emb = self
            .store
            .get_embeddings(DocumentKind::Cv, cv_id)
            .await?
            .ok_or(AppError::MissingEmbeddings(cv_id))?;

        if jd.embeddings.embedding_model_id != cv_emb.embedding_model_id {
            return Err(AppError::Invariant(format!(
                "embedding model drift: jd={} cv={}",
                jd.embeddings.embedding_model_id, cv_emb.embedding_model_id
            )));
        }

        // scored — similarity math runs on the bounded CPU pool, never on
        // the I/O workers.
        let jd_structured = jd.structured.clone();
        let jd_emb = jd.embeddings.clone();
        let weights = self.weights.clone();
        let categories = self.categories.clone();
        let score = self
            .cpu_pool
            .run(move || {
                compute_score(&jd_structured, &jd_emb, &cv, &cv_emb, &weights, &categories)
            })
            .await?;

        // cached — a cache failure is non-fatal, the score still returns.
        self.cache.set_json(&key, &score, MATCH_TTL).await;

        Ok(score)
    }
}
