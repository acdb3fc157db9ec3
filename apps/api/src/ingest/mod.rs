//! Ingestion orchestrator: the upload pipeline (parse → mask → extract →
//! embed → store) run as checkpointed queue jobs, plus the bulk match
//! fan-out. Identical content aliases the existing records instead of
//! re-running the pipeline.

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cpu_pool::CpuPool;
use crate::db;
use crate::embedding::DocEmbedder;
use crate::errors::AppError;
use crate::extraction::{content_hash, Extractor};
use crate::matcher::{rank_bulk, Matcher, Score};
use crate::models::{Application, Document, DocumentKind, Source};
use crate::object_store::ObjectStore;
use crate::parser::Parser;
use crate::queue::{Job, JobContext, JobHandler, JobKind, JobQueue, Priority};
use crate::store::DocStore;

const PARSE_TIMEOUT: Duration = Duration::from_secs(30);
/// Bulk match fans out in chunks of this many CVs.
const BULK_CHUNK: usize = 50;

/// Returned by an upload: the queue job is absent when the content aliased
/// an already-ingested document.
#[derive(Debug, Serialize)]
pub struct UploadReceipt {
    pub document_id: Uuid,
    pub job_id: Option<Uuid>,
    pub aliased: bool,
}

/// Payload for ingest jobs.
#[derive(Debug, Serialize, Deserialize)]
struct IngestPayload {
    document_id: Uuid,
    kind: DocumentKind,
    blob_key: String,
    declared_mime: String,
    source: Source,
}

/// Payload for e-mail application jobs.
#[derive(Debug, Serialize, Deserialize)]
pub struct EmailApplicationPayload {
    pub posting_id: Uuid,
    pub blob_key: String,
    pub declared_mime: String,
    pub applicant_name: Option<String>,
    pub applicant_email: Option<String>,
    pub message_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BulkMatchPayload {
    jd_id: Uuid,
    cv_ids: Vec<Uuid>,
}

/// One row of a bulk match reply, in rank order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkMatchEntry {
    pub cv_id: Uuid,
    pub score: Option<Score>,
    pub error: Option<String>,
}

pub struct Orchestrator {
    parser: Arc<Parser>,
    extractor: Arc<Extractor>,
    embedder: Arc<DocEmbedder>,
    store: Arc<DocStore>,
    blobs: Arc<dyn ObjectStore>,
    matcher: Arc<Matcher>,
    cpu_pool: Arc<CpuPool>,
    pool: Option<PgPool>,
    /// `(kind, content_hash) → document id` for alias-on-upload. Rebuilt
    /// lazily as documents flow through this process.
    hash_index: Mutex<HashMap<(DocumentKind, String), Uuid>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parser: Arc<Parser>,
        extractor: Arc<Extractor>,
        embedder: Arc<DocEmbedder>,
        store: Arc<DocStore>,
        blobs: Arc<dyn ObjectStore>,
        matcher: Arc<Matcher>,
        cpu_pool: Arc<CpuPool>,
        pool: Option<PgPool>,
    ) -> Self {
        Self {
            parser,
            extractor,
            embedder,
            store,
            blobs,
            matcher,
            cpu_pool,
            pool,
            hash_index: Mutex::new(HashMap::new()),
        }
    }

    /// Upload entry point. Parses once to compute the content hash; known
    /// content aliases the existing records under a fresh id, new content
    /// stores the blob and enqueues the pipeline job.
    pub async fn submit_upload(
        &self,
        queue: &Arc<JobQueue>,
        kind: DocumentKind,
        bytes: Bytes,
        declared_mime: &str,
        source: Source,
    ) -> Result<UploadReceipt, AppError> {
        let parsed = self.parse_bytes(bytes.clone(), declared_mime.to_string()).await?;
        let hash = content_hash(&parsed.text);

        let existing = {
            let index = self.hash_index.lock().unwrap();
            index.get(&(kind, hash.clone())).copied()
        };
        if let Some(source_id) = existing {
            if let Some(document_id) = self.alias_document(kind, source_id, &hash).await? {
                info!("Upload aliased to existing content {hash}");
                return Ok(UploadReceipt {
                    document_id,
                    job_id: None,
                    aliased: true,
                });
            }
        }

        let document_id = Uuid::new_v4();
        let blob_key = format!("uploads/{}/{document_id}", kind.collection_prefix());
        self.blobs.put(&blob_key, bytes).await?;

        let payload = IngestPayload {
            document_id,
            kind,
            blob_key,
            declared_mime: declared_mime.to_string(),
            source,
        };
        let job_kind = match kind {
            DocumentKind::Cv => JobKind::IngestCv,
            DocumentKind::Jd => JobKind::IngestJd,
        };
        let job_id = queue
            .submit(
                job_kind,
                Priority::Normal,
                serde_json::to_value(&payload).map_err(|e| AppError::Internal(e.into()))?,
                hash,
                None,
            )
            .await?;

        Ok(UploadReceipt {
            document_id,
            job_id: Some(job_id),
            aliased: false,
        })
    }

    /// Copies the three records of `source_id` under a new id. Returns
    /// `None` when the alias source vanished (deleted between uploads).
    async fn alias_document(
        &self,
        kind: DocumentKind,
        source_id: Uuid,
        hash: &str,
    ) -> Result<Option<Uuid>, AppError> {
        let Some(mut document) = self.store.get_document(kind, source_id).await? else {
            self.hash_index
                .lock()
                .unwrap()
                .remove(&(kind, hash.to_string()));
            return Ok(None);
        };
        let Some(structured) = self.store.get_structured(kind, source_id).await? else {
            return Ok(None);
        };
        let Some(embeddings) = self.store.get_embeddings(kind, source_id).await? else {
            return Ok(None);
        };

        let new_id = Uuid::new_v4();
        document.id = new_id;
        document.upload_time = Utc::now();
        self.store
            .put_all(kind, &document, &structured, &embeddings)
            .await?;
        Ok(Some(new_id))
    }

    async fn parse_bytes(
        &self,
        bytes: Bytes,
        declared_mime: String,
    ) -> Result<crate::parser::ParsedDocument, AppError> {
        let parser = self.parser.clone();
        tokio::time::timeout(
            PARSE_TIMEOUT,
            self.cpu_pool
                .run(move || parser.parse(&bytes, &declared_mime)),
        )
        .await
        .map_err(|_| AppError::DeadlineExceeded)??
    }

    /// The checkpointed pipeline. Parse and the cache-backed extract/embed
    /// steps are deterministic, so a resumed attempt recomputes them
    /// cheaply; checkpoints prevent duplicate side effects (PII rows,
    /// store writes) and surface progress on `GET /job/{id}`.
    async fn run_ingest(&self, payload: IngestPayload, ctx: &JobContext) -> Result<Value, AppError> {
        let IngestPayload {
            document_id,
            kind,
            blob_key,
            declared_mime,
            source,
        } = payload;

        // parse
        let bytes = self.blobs.get(&blob_key).await?;
        let parsed = self.parse_bytes(bytes, declared_mime).await?;
        let hash = content_hash(&parsed.text);
        ctx.checkpoint("parse").await;
        if ctx.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        // mask: the text is already masked by the parser; this step owns
        // the PII side-map write.
        if !ctx.already_done("mask") {
            if let Some(pool) = &self.pool {
                db::upsert_document_pii(
                    pool,
                    document_id,
                    parsed.pii.primary_email(),
                    parsed.pii.primary_phone(),
                )
                .await?;
            }
            ctx.checkpoint("mask").await;
        }

        // extract
        let mut structured = self.extractor.extract(&parsed.text, kind).await?;
        structured.masked_pii.email = parsed
            .pii
            .primary_email()
            .map(|_| crate::parser::pii::EMAIL_TOKEN.to_string());
        structured.masked_pii.phone = parsed
            .pii
            .primary_phone()
            .map(|_| crate::parser::pii::PHONE_TOKEN.to_string());
        ctx.checkpoint("extract").await;
        if ctx.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        // embed
        let embeddings = self.embedder.embed_doc(&structured).await?;
        ctx.checkpoint("embed").await;
        if ctx.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        // store
        let document = Document {
            id: document_id,
            kind,
            blob_ref: blob_key,
            content_hash: hash.clone(),
            raw_text: parsed.text,
            upload_time: Utc::now(),
            source,
        };
        self.store
            .put_all(kind, &document, &structured, &embeddings)
            .await?;
        ctx.checkpoint("store").await;

        self.hash_index
            .lock()
            .unwrap()
            .insert((kind, hash.clone()), document_id);

        Ok(json!({
            "document_id": document_id,
            "content_hash": hash,
            "skills": structured.present_skills(),
            "responsibilities": structured.present_responsibilities(),
            "warnings": parsed.warnings,
        }))
    }

    async fn run_email_application(
        &self,
        payload: EmailApplicationPayload,
        ctx: &JobContext,
    ) -> Result<Value, AppError> {
        let ingest = IngestPayload {
            document_id: Uuid::new_v4(),
            kind: DocumentKind::Cv,
            blob_key: payload.blob_key.clone(),
            declared_mime: payload.declared_mime.clone(),
            source: Source::EmailApplication,
        };
        let cv_id = ingest.document_id;
        let result = self.run_ingest(ingest, ctx).await?;

        let application = Application {
            application_id: Uuid::new_v4(),
            posting_id: payload.posting_id,
            cv_id,
            applicant_name: payload.applicant_name,
            applicant_email: payload.applicant_email,
            applicant_phone: None,
            email_id: payload.message_id,
            submitted_at: Utc::now(),
            requires_manual_matching: true,
            orphaned: false,
        };
        if let Some(pool) = &self.pool {
            db::insert_application(pool, &application).await?;
        } else {
            warn!("No relational store configured, application not recorded");
        }

        Ok(json!({
            "application_id": application.application_id,
            "cv_id": cv_id,
            "posting_id": application.posting_id,
            "ingest": result,
        }))
    }

    /// `BulkMatch(jd_id, cv_ids[])`: JD loaded once, CV sub-tasks fanned
    /// out in chunks, results reassembled by index and ranked.
    pub async fn bulk_match(
        &self,
        jd_id: Uuid,
        cv_ids: &[Uuid],
    ) -> Result<Vec<BulkMatchEntry>, AppError> {
        let jd = Arc::new(self.matcher.load_jd(jd_id).await?);

        let mut by_index: Vec<Option<BulkMatchEntry>> = (0..cv_ids.len()).map(|_| None).collect();
        for (chunk_idx, chunk) in cv_ids.chunks(BULK_CHUNK).enumerate() {
            let mut set = JoinSet::new();
            for (offset, &cv_id) in chunk.iter().enumerate() {
                let index = chunk_idx * BULK_CHUNK + offset;
                let matcher = self.matcher.clone();
                let jd = jd.clone();
                set.spawn(async move {
                    let outcome = matcher.match_with_loaded_jd(jd_id, &jd, cv_id).await;
                    (index, cv_id, outcome)
                });
            }
            while let Some(joined) = set.join_next().await {
                let (index, cv_id, outcome) =
                    joined.map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
                by_index[index] = Some(match outcome {
                    Ok(score) => BulkMatchEntry {
                        cv_id,
                        score: Some(score),
                        error: None,
                    },
                    Err(e) => BulkMatchEntry {
                        cv_id,
                        score: None,
                        error: Some(e.to_string()),
                    },
                });
            }
        }

        // Reassembled by index; now rank the scorable ones.
        let mut scored: Vec<(Uuid, Score)> = Vec::new();
        let mut unscorable: Vec<BulkMatchEntry> = Vec::new();
        for entry in by_index.into_iter().flatten() {
            match entry.score {
                Some(ref score) => scored.push((entry.cv_id, score.clone())),
                None => unscorable.push(entry),
            }
        }
        rank_bulk(&mut scored);
        unscorable.sort_by_key(|e| e.cv_id.to_string());

        let mut out: Vec<BulkMatchEntry> = scored
            .into_iter()
            .map(|(cv_id, score)| BulkMatchEntry {
                cv_id,
                score: Some(score),
                error: None,
            })
            .collect();
        out.extend(unscorable);
        Ok(out)
    }

    /// Cascade delete: blob, the three store mirrors, the PII row, and the
    /// soft orphan marker on applications.
    pub async fn delete_document(&self, kind: DocumentKind, id: Uuid) -> Result<(), AppError> {
        if let Some(document) = self.store.get_document(kind, id).await? {
            if let Err(e) = self.blobs.delete(&document.blob_ref).await {
                warn!("Blob delete for {id} failed: {e}");
            }
            self.extractor.invalidate(&document.raw_text, kind).await;
            self.hash_index
                .lock()
                .unwrap()
                .remove(&(kind, document.content_hash));
        }
        self.store.delete_doc(kind, id).await?;
        if let Some(pool) = &self.pool {
            db::delete_document_pii(pool, id).await?;
            if kind == DocumentKind::Cv {
                db::orphan_applications_for_cv(pool, id).await?;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobHandler for Orchestrator {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<Value, AppError> {
        match job.kind {
            JobKind::IngestCv | JobKind::IngestJd => {
                let payload: IngestPayload = serde_json::from_value(job.payload.clone())
                    .map_err(|e| AppError::Invariant(format!("bad ingest payload: {e}")))?;
                self.run_ingest(payload, ctx).await
            }
            JobKind::EmailApplication => {
                let payload: EmailApplicationPayload = serde_json::from_value(job.payload.clone())
                    .map_err(|e| AppError::Invariant(format!("bad application payload: {e}")))?;
                self.run_email_application(payload, ctx).await
            }
            JobKind::BulkMatch => {
                let payload: BulkMatchPayload = serde_json::from_value(job.payload.clone())
                    .map_err(|e| AppError::Invariant(format!("bad bulk payload: {e}")))?;
                let entries = self.bulk_match(payload.jd_id, &payload.cv_ids).await?;
                Ok(serde_json::to_value(entries).map_err(|e| AppError::Internal(e.into()))?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCache;
    use crate::embedding::tests::HashEmbedder;
    use crate::llm_client::{CompletionParams, Llm, LlmError};
    use crate::matcher::{CategoryTable, MatchWeights};
    use crate::object_store::MemoryObjectStore;
    use crate::queue::QueueConfig;
    use crate::store::MemoryVectorDb;
    use async_trait::async_trait;

    /// Emits a fixed extraction whose skills derive from the text length,
    /// keeping distinct uploads distinct.
    struct CannedLlm;

    #[async_trait]
    impl Llm for CannedLlm {
        async fn complete(
            &self,
            prompt: &str,
            _system: &str,
            _schema: &Value,
            _params: CompletionParams,
        ) -> Result<Value, LlmError> {
            let title = if prompt.contains("job description") {
                "Data Engineer"
            } else {
                "Data Analyst"
            };
            Ok(json!({
                "job_title": title,
                "category": "Software Engineering",
                "skills": ["sql", "python"],
                "responsibilities": ["Builds data pipelines."],
                "years_experience": 3.0,
            }))
        }

        fn model_id(&self) -> &str {
            "canned-llm"
        }
    }

    fn build() -> (Arc<Orchestrator>, Arc<JobQueue>, Arc<DocStore>) {
        let cache = Arc::new(TieredCache::new(None));
        let store = Arc::new(DocStore::new(Arc::new(MemoryVectorDb::default())));
        let cpu_pool = Arc::new(CpuPool::new(2));
        let matcher = Arc::new(Matcher::new(
            store.clone(),
            cache.clone(),
            cpu_pool.clone(),
            MatchWeights::default(),
            CategoryTable::default_table(),
            Duration::from_secs(5),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(Parser::default()),
            Arc::new(Extractor::new(Arc::new(CannedLlm), cache.clone())),
            Arc::new(DocEmbedder::new(Arc::new(HashEmbedder::new()), cache)),
            store.clone(),
            Arc::new(MemoryObjectStore::default()),
            matcher,
            cpu_pool,
            None,
        ));
        let queue = Arc::new(JobQueue::new(QueueConfig::default(), None));
        (orchestrator, queue, store)
    }

    async fn run_pending_job(orchestrator: &Arc<Orchestrator>, queue: &Arc<JobQueue>) {
        let lease = queue.try_lease().expect("job queued");
        let ctx = JobContext::new(
            lease.job.id,
            lease.cancel.clone(),
            queue.clone(),
            lease.resume_from.clone(),
        );
        let result = orchestrator.handle(&lease.job, &ctx).await.unwrap();
        queue.complete(lease.job.id, result).await;
    }

    #[tokio::test]
    async fn test_upload_pipeline_end_to_end() {
        let (orchestrator, queue, store) = build();
        let receipt = orchestrator
            .submit_upload(
                &queue,
                DocumentKind::Cv,
                Bytes::from_static(b"Jane Doe\n\nRust engineer, jane@x.com"),
                "text/plain",
                Source::Direct,
            )
            .await
            .unwrap();
        assert!(!receipt.aliased);
        run_pending_job(&orchestrator, &queue).await;

        let doc = store
            .get_document(DocumentKind::Cv, receipt.document_id)
            .await
            .unwrap()
            .expect("document stored");
        assert!(doc.raw_text.contains("[EMAIL]"));
        assert!(store
            .get_structured(DocumentKind::Cv, receipt.document_id)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .get_embeddings(DocumentKind::Cv, receipt.document_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_duplicate_content_aliases_without_new_job() {
        let (orchestrator, queue, store) = build();
        let bytes = Bytes::from_static(b"Same resume content");
        let first = orchestrator
            .submit_upload(&queue, DocumentKind::Cv, bytes.clone(), "text/plain", Source::Direct)
            .await
            .unwrap();
        run_pending_job(&orchestrator, &queue).await;

        let second = orchestrator
            .submit_upload(&queue, DocumentKind::Cv, bytes, "text/plain", Source::Direct)
            .await
            .unwrap();
        assert!(second.aliased);
        assert!(second.job_id.is_none());
        assert_ne!(second.document_id, first.document_id);
        // The alias carries full records under the new id.
        assert!(store
            .get_embeddings(DocumentKind::Cv, second.document_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_bulk_match_single_cv_equals_match() {
        let (orchestrator, queue, _store) = build();
        let jd = orchestrator
            .submit_upload(
                &queue,
                DocumentKind::Jd,
                Bytes::from_static(b"Data Engineer wanted, sql and python"),
                "text/plain",
                Source::Direct,
            )
            .await
            .unwrap();
        run_pending_job(&orchestrator, &queue).await;
        let cv = orchestrator
            .submit_upload(
                &queue,
                DocumentKind::Cv,
                Bytes::from_static(b"I write sql and python"),
                "text/plain",
                Source::Direct,
            )
            .await
            .unwrap();
        run_pending_job(&orchestrator, &queue).await;

        let single = orchestrator
            .matcher
            .match_pair(jd.document_id, cv.document_id)
            .await
            .unwrap();
        let bulk = orchestrator
            .bulk_match(jd.document_id, &[cv.document_id])
            .await
            .unwrap();
        assert_eq!(bulk.len(), 1);
        assert_eq!(bulk[0].score.as_ref().unwrap().overall, single.overall);
    }

    #[tokio::test]
    async fn test_bulk_match_ranks_and_reports_unscorable() {
        let (orchestrator, queue, _store) = build();
        let jd = orchestrator
            .submit_upload(
                &queue,
                DocumentKind::Jd,
                Bytes::from_static(b"Data Engineer role"),
                "text/plain",
                Source::Direct,
            )
            .await
            .unwrap();
        run_pending_job(&orchestrator, &queue).await;
        let cv = orchestrator
            .submit_upload(
                &queue,
                DocumentKind::Cv,
                Bytes::from_static(b"A real candidate"),
                "text/plain",
                Source::Direct,
            )
            .await
            .unwrap();
        run_pending_job(&orchestrator, &queue).await;

        let ghost = Uuid::new_v4();
        let entries = orchestrator
            .bulk_match(jd.document_id, &[ghost, cv.document_id])
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].cv_id, cv.document_id);
        assert!(entries[0].score.is_some());
        assert_eq!(entries[1].cv_id, ghost);
        assert!(entries[1].error.is_some());
    }

    #[tokio::test]
    async fn test_bulk_match_missing_jd_not_scorable() {
        let (orchestrator, _queue, _store) = build();
        let err = orchestrator
            .bulk_match(Uuid::new_v4(), &[Uuid::new_v4()])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MissingEmbeddings(_)));
    }

    #[tokio::test]
    async fn test_delete_document_cascades() {
        let (orchestrator, queue, store) = build();
        let receipt = orchestrator
            .submit_upload(
                &queue,
                DocumentKind::Cv,
                Bytes::from_static(b"to be deleted"),
                "text/plain",
                Source::Direct,
            )
            .await
            .unwrap();
        run_pending_job(&orchestrator, &queue).await;

        orchestrator
            .delete_document(DocumentKind::Cv, receipt.document_id)
            .await
            .unwrap();
        for missing in [
            store
                .get_document(DocumentKind::Cv, receipt.document_id)
                .await
                .unwrap()
                .is_none(),
            store
                .get_structured(DocumentKind::Cv, receipt.document_id)
                .await
                .unwrap()
                .is_none(),
            store
                .get_embeddings(DocumentKind::Cv, receipt.document_id)
                .await
                .unwrap()
                .is_none(),
        ] {
            assert!(missing);
        }
    }
}
