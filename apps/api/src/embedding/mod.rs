//! Embedder: turns a `Structured` record into the 32-vector bundle.
//!
//! Each of the 20 skill phrases and 10 responsibility sentences is embedded
//! independently (no concatenation), plus one vector for the title and one
//! for the stringified experience. Pad slots become the zero vector and are
//! excluded from matching entirely.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::cache::{emb_key, TieredCache, EMB_TTL};
use crate::errors::AppError;
use crate::extraction::content_hash;
use crate::models::embeddings::{l2_norm, l2_normalize, EmbeddingsRecord};
use crate::models::{Structured, EMBEDDING_DIM, PAD_SENTINEL, RESP_SLOTS, SKILL_SLOTS};

/// Phrases per upstream request.
pub const BATCH_SIZE: usize = 64;

/// Narrow embedding interface. The backend returns raw (not necessarily
/// normalized) vectors; normalization happens here.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, phrases: &[String]) -> Result<Vec<Vec<f32>>, AppError>;

    /// Model tag recorded with every embeddings record.
    fn model_id(&self) -> &str;
}

/// OpenAI-compatible `/embeddings` backend.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            base_url,
            model,
            api_key,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, phrases: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if phrases.is_empty() {
            return Ok(vec![]);
        }
        let body = serde_json::json!({
            "model": &self.model,
            "input": phrases,
        });
        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url.trim_end_matches('/')))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::EmbedderUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::EmbedderUnavailable(format!(
                "status {status}: {body}"
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| AppError::EmbedderUnavailable(format!("bad reply: {e}")))?;

        if parsed.data.len() != phrases.len() {
            return Err(AppError::EmbedderUnavailable(format!(
                "asked for {} vectors, got {}",
                phrases.len(),
                parsed.data.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// The document-level embedding component: batching, normalization, pad
/// handling, and the per-phrase cache.
pub struct DocEmbedder {
    backend: Arc<dyn Embedder>,
    cache: Arc<TieredCache>,
}

impl DocEmbedder {
    pub fn new(backend: Arc<dyn Embedder>, cache: Arc<TieredCache>) -> Self {
        Self { backend, cache }
    }

    /// `EmbedDoc(Structured) → Embeddings`.
    pub async fn embed_doc(&self, structured: &Structured) -> Result<EmbeddingsRecord, AppError> {
        debug_assert_eq!(structured.skills.len(), SKILL_SLOTS);
        debug_assert_eq!(structured.responsibilities.len(), RESP_SLOTS);

        let experience_text = format!(
            "{} years of experience",
            structured.years_experience
        );

        // Fixed order: skills, responsibilities, title, experience.
        let mut slots: Vec<&str> = Vec::with_capacity(SKILL_SLOTS + RESP_SLOTS + 2);
        slots.extend(structured.skills.iter().map(String::as_str));
        slots.extend(structured.responsibilities.iter().map(String::as_str));
        slots.push(structured.job_title.as_str());
        slots.push(experience_text.as_str());

        let vectors = self.embed_slots(&slots).await?;
        let mut rows = vectors.into_iter();

        let record = EmbeddingsRecord {
            skill_vectors: rows.by_ref().take(SKILL_SLOTS).collect(),
            resp_vectors: rows.by_ref().take(RESP_SLOTS).collect(),
            title_vector: rows.next().expect("title vector"),
            experience_vector: rows.next().expect("experience vector"),
            embedding_model_id: self.backend.model_id().to_string(),
        };
        record.validate()?;
        Ok(record)
    }

    /// Resolves each slot to a vector: pads to zero, cached phrases from the
    /// cache, the rest from the backend in batches of [`BATCH_SIZE`].
    async fn embed_slots(&self, slots: &[&str]) -> Result<Vec<Vec<f32>>, AppError> {
        let model_id = self.backend.model_id().to_string();
        let mut out: Vec<Option<Vec<f32>>> = vec![None; slots.len()];
        let mut missing: Vec<usize> = Vec::new();

        for (i, slot) in slots.iter().enumerate() {
            if *slot == PAD_SENTINEL {
                out[i] = Some(vec![0.0; EMBEDDING_DIM]);
                continue;
            }
            let key = emb_key(&model_id, &content_hash(slot));
            match self.cache.get_json::<Vec<f32>>(&key).await {
                Some(v) if v.len() == EMBEDDING_DIM => out[i] = Some(v),
                _ => missing.push(i),
            }
        }

        if !missing.is_empty() {
            debug!("Embedding {} uncached phrases", missing.len());
        }

        for batch in missing.chunks(BATCH_SIZE) {
            let phrases: Vec<String> = batch.iter().map(|&i| slots[i].to_string()).collect();
            let vectors = self.backend.embed(&phrases).await?;

            for (&slot_idx, mut vector) in batch.iter().zip(vectors.into_iter()) {
                if vector.len() != EMBEDDING_DIM {
                    return Err(AppError::DimMismatch {
                        expected: EMBEDDING_DIM,
                        got: vector.len(),
                    });
                }
                l2_normalize(&mut vector);
                if l2_norm(&vector) == 0.0 {
                    // A real phrase must not embed to zero; zero is the pad
                    // marker and would silently drop it from every match.
                    return Err(AppError::EmbedderUnavailable(
                        "backend returned a zero vector for a non-pad phrase".to_string(),
                    ));
                }
                let key = emb_key(&model_id, &content_hash(slots[slot_idx]));
                self.cache.set_json(&key, &vector, EMB_TTL).await;
                out[slot_idx] = Some(vector);
            }
        }

        Ok(out
            .into_iter()
            .map(|v| v.expect("every slot resolved"))
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Deterministic double: maps each phrase to a stable pseudo-random
    /// direction derived from its hash. Records batch sizes.
    pub(crate) struct HashEmbedder {
        pub batches: Mutex<Vec<usize>>,
        pub dim: usize,
    }

    impl HashEmbedder {
        pub(crate) fn new() -> Self {
            Self {
                batches: Mutex::new(vec![]),
                dim: EMBEDDING_DIM,
            }
        }

        pub(crate) fn with_dim(dim: usize) -> Self {
            Self {
                batches: Mutex::new(vec![]),
                dim,
            }
        }
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        async fn embed(&self, phrases: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            self.batches.lock().unwrap().push(phrases.len());
            Ok(phrases
                .iter()
                .map(|p| {
                    let h = content_hash(p);
                    let mut v = vec![0.0_f32; self.dim];
                    for (i, byte) in h.as_bytes().iter().enumerate() {
                        v[i % self.dim] += *byte as f32;
                    }
                    v
                })
                .collect())
        }

        fn model_id(&self) -> &str {
            "hash-embed-001"
        }
    }

    fn structured_with_pads() -> Structured {
        let mut skills: Vec<String> = vec!["rust".into(), "sql".into(), "tokio".into()];
        skills.resize(SKILL_SLOTS, PAD_SENTINEL.to_string());
        let mut responsibilities: Vec<String> = vec!["Ships backend services.".into()];
        responsibilities.resize(RESP_SLOTS, PAD_SENTINEL.to_string());
        Structured {
            job_title: "Backend Engineer".into(),
            category: "Software Engineering".into(),
            skills,
            responsibilities,
            years_experience: 3.0,
            masked_pii: Default::default(),
        }
    }

    fn doc_embedder(backend: Arc<HashEmbedder>) -> DocEmbedder {
        DocEmbedder::new(backend, Arc::new(TieredCache::new(None)))
    }

    #[tokio::test]
    async fn test_record_shape_and_norms() {
        let record = doc_embedder(Arc::new(HashEmbedder::new()))
            .embed_doc(&structured_with_pads())
            .await
            .unwrap();
        assert!(record.validate().is_ok());
        assert_eq!(record.skill_vectors.len(), SKILL_SLOTS);
        assert_eq!(record.resp_vectors.len(), RESP_SLOTS);
        for v in &record.skill_vectors[..3] {
            assert!((l2_norm(v) - 1.0).abs() < 1e-4);
        }
    }

    #[tokio::test]
    async fn test_pads_embed_to_zero() {
        let record = doc_embedder(Arc::new(HashEmbedder::new()))
            .embed_doc(&structured_with_pads())
            .await
            .unwrap();
        for v in &record.skill_vectors[3..] {
            assert_eq!(l2_norm(v), 0.0);
        }
        for v in &record.resp_vectors[1..] {
            assert_eq!(l2_norm(v), 0.0);
        }
    }

    #[tokio::test]
    async fn test_pads_never_reach_backend() {
        let backend = Arc::new(HashEmbedder::new());
        doc_embedder(backend.clone())
            .embed_doc(&structured_with_pads())
            .await
            .unwrap();
        let total: usize = backend.batches.lock().unwrap().iter().sum();
        // 3 skills + 1 responsibility + title + experience = 6 phrases.
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn test_batches_capped_at_64() {
        let backend = Arc::new(HashEmbedder::new());
        let cache = Arc::new(TieredCache::new(None));
        let embedder = DocEmbedder::new(backend.clone(), cache);
        let slots: Vec<String> = (0..100).map(|i| format!("phrase {i}")).collect();
        let refs: Vec<&str> = slots.iter().map(String::as_str).collect();
        embedder.embed_slots(&refs).await.unwrap();
        let batches = backend.batches.lock().unwrap().clone();
        assert_eq!(batches, vec![64, 36]);
    }

    #[tokio::test]
    async fn test_phrase_cache_prevents_repeat_calls() {
        let backend = Arc::new(HashEmbedder::new());
        let embedder = doc_embedder(backend.clone());
        let s = structured_with_pads();
        embedder.embed_doc(&s).await.unwrap();
        embedder.embed_doc(&s).await.unwrap();
        let total: usize = backend.batches.lock().unwrap().iter().sum();
        assert_eq!(total, 6, "second doc must be served from the cache");
    }

    #[tokio::test]
    async fn test_dim_mismatch_is_fatal() {
        let backend = Arc::new(HashEmbedder::with_dim(384));
        let err = doc_embedder(backend)
            .embed_doc(&structured_with_pads())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::DimMismatch {
                expected: 768,
                got: 384
            }
        ));
    }

    #[tokio::test]
    async fn test_determinism_per_phrase() {
        let embedder = doc_embedder(Arc::new(HashEmbedder::new()));
        let s = structured_with_pads();
        let a = embedder.embed_doc(&s).await.unwrap();
        let b = embedder.embed_doc(&s).await.unwrap();
        assert_eq!(a, b);
    }
}
