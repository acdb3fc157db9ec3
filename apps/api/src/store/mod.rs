//! Vector store: single-point-per-document storage across six logical
//! collections (`cv_documents`, `cv_structured`, `cv_embeddings` and the
//! `jd_*` mirrors). One record per document id; the matcher pulls records by
//! id and computes similarity in-process, so the store is point-lookup only.

pub mod qdrant;

use async_trait::async_trait;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Document, DocumentKind, EmbeddingsRecord, Structured};

/// The three mirror collections every document kind has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Documents,
    Structured,
    Embeddings,
}

impl Collection {
    pub fn name(&self, kind: DocumentKind) -> String {
        let suffix = match self {
            Collection::Documents => "documents",
            Collection::Structured => "structured",
            Collection::Embeddings => "embeddings",
        };
        format!("{}_{suffix}", kind.collection_prefix())
    }

    /// All six collection names, creation order.
    pub fn all_names() -> Vec<String> {
        let mut out = Vec::with_capacity(6);
        for kind in [DocumentKind::Cv, DocumentKind::Jd] {
            for c in [
                Collection::Documents,
                Collection::Structured,
                Collection::Embeddings,
            ] {
                out.push(c.name(kind));
            }
        }
        out
    }
}

/// Narrow point-storage interface. `put` must upsert by id.
#[async_trait]
pub trait VectorDb: Send + Sync {
    async fn put(&self, collection: &str, id: Uuid, payload: Value) -> Result<(), AppError>;
    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<Value>, AppError>;
    async fn delete(&self, collection: &str, id: Uuid) -> Result<(), AppError>;
    async fn ping(&self) -> Result<(), AppError>;
}

fn gzip_b64(text: &str) -> Result<String, AppError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .and_then(|_| encoder.finish())
        .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("compress failed: {e}")))
}

fn gunzip_b64(encoded: &str) -> Result<String, AppError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| AppError::Invariant(format!("bad compressed payload: {e}")))?;
    let mut out = String::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_string(&mut out)
        .map_err(|e| AppError::Invariant(format!("bad gzip stream: {e}")))?;
    Ok(out)
}

/// Typed facade over [`VectorDb`]. Writes to the same document id are
/// serialized by a per-id advisory lock; cross-collection writes are not
/// transactional but every put is an idempotent upsert, so retries converge.
pub struct DocStore {
    db: Arc<dyn VectorDb>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl DocStore {
    pub fn new(db: Arc<dyn VectorDb>) -> Self {
        Self {
            db,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn ping(&self) -> Result<(), AppError> {
        self.db.ping().await
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(id).or_default().clone()
    }

    /// Writes all three records for a document under one advisory lock.
    pub async fn put_all(
        &self,
        kind: DocumentKind,
        document: &Document,
        structured: &Structured,
        embeddings: &EmbeddingsRecord,
    ) -> Result<(), AppError> {
        let lock = self.lock_for(document.id).await;
        let _guard = lock.lock().await;
        self.put_document_inner(kind, document).await?;
        self.put_structured_inner(kind, document.id, structured)
            .await?;
        self.put_embeddings_inner(kind, document.id, embeddings)
            .await?;
        Ok(())
    }

    pub async fn put_document(&self, kind: DocumentKind, doc: &Document) -> Result<(), AppError> {
        let lock = self.lock_for(doc.id).await;
        let _guard = lock.lock().await;
        self.put_document_inner(kind, doc).await
    }

    async fn put_document_inner(
        &self,
        kind: DocumentKind,
        doc: &Document,
    ) -> Result<(), AppError> {
        // raw_text is compressed at rest; everything else stays queryable.
        let payload = json!({
            "id": doc.id,
            "kind": doc.kind,
            "blob_ref": doc.blob_ref,
            "content_hash": doc.content_hash,
            "raw_text_gz": gzip_b64(&doc.raw_text)?,
            "upload_time": doc.upload_time,
            "source": doc.source,
        });
        self.db
            .put(&Collection::Documents.name(kind), doc.id, payload)
            .await
    }

    async fn put_structured_inner(
        &self,
        kind: DocumentKind,
        id: Uuid,
        structured: &Structured,
    ) -> Result<(), AppError> {
        let payload = serde_json::to_value(structured)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        self.db
            .put(&Collection::Structured.name(kind), id, payload)
            .await
    }

    async fn put_embeddings_inner(
        &self,
        kind: DocumentKind,
        id: Uuid,
        record: &EmbeddingsRecord,
    ) -> Result<(), AppError> {
        record.validate()?;
        let payload = json!({
            "embedding_model_id": record.embedding_model_id,
            "vectors_b64": base64::engine::general_purpose::STANDARD.encode(record.to_le_bytes()),
        });
        self.db
            .put(&Collection::Embeddings.name(kind), id, payload)
            .await
    }

    pub async fn get_document(
        &self,
        kind: DocumentKind,
        id: Uuid,
    ) -> Result<Option<Document>, AppError> {
        let Some(payload) = self.db.get(&Collection::Documents.name(kind), id).await? else {
            return Ok(None);
        };
        let raw_text = match payload.get("raw_text_gz").and_then(Value::as_str) {
            Some(gz) => gunzip_b64(gz)?,
            None => String::new(),
        };
        let mut doc: Document = serde_json::from_value(json!({
            "id": payload["id"],
            "kind": payload["kind"],
            "blob_ref": payload["blob_ref"],
            "content_hash": payload["content_hash"],
            "raw_text": "",
            "upload_time": payload["upload_time"],
            "source": payload["source"],
        }))
        .map_err(|e| AppError::Invariant(format!("bad document payload: {e}")))?;
        doc.raw_text = raw_text;
        Ok(Some(doc))
    }

    pub async fn get_structured(
        &self,
        kind: DocumentKind,
        id: Uuid,
    ) -> Result<Option<Structured>, AppError> {
        let Some(payload) = self.db.get(&Collection::Structured.name(kind), id).await? else {
            return Ok(None);
        };
        let structured: Structured = serde_json::from_value(payload)
            .map_err(|e| AppError::Invariant(format!("bad structured payload: {e}")))?;
        Ok(Some(structured))
    }

    pub async fn get_embeddings(
        &self,
        kind: DocumentKind,
        id: Uuid,
    ) -> Result<Option<EmbeddingsRecord>, AppError> {
        let Some(payload) = self.db.get(&Collection::Embeddings.name(kind), id).await? else {
            return Ok(None);
        };
        let model_id = payload
            .get("embedding_model_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let encoded = payload
            .get("vectors_b64")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Invariant("embeddings payload missing vectors".into()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| AppError::Invariant(format!("bad vectors blob: {e}")))?;
        Ok(Some(EmbeddingsRecord::from_le_bytes(&bytes, model_id)?))
    }

    /// Removes a document from all three mirrors in fixed order
    /// (embeddings, structured, documents). Safe to retry: deleting an
    /// absent point is a no-op.
    pub async fn delete_doc(&self, kind: DocumentKind, id: Uuid) -> Result<(), AppError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        for collection in [
            Collection::Embeddings,
            Collection::Structured,
            Collection::Documents,
        ] {
            self.db.delete(&collection.name(kind), id).await?;
        }
        self.locks.lock().await.remove(&id);
        Ok(())
    }
}

/// In-memory [`VectorDb`] backing the adapter-contract tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryVectorDb {
    points: Mutex<HashMap<(String, Uuid), Value>>,
}

#[cfg(test)]
#[async_trait]
impl VectorDb for MemoryVectorDb {
    async fn put(&self, collection: &str, id: Uuid, payload: Value) -> Result<(), AppError> {
        self.points
            .lock()
            .await
            .insert((collection.to_string(), id), payload);
        Ok(())
    }

    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<Value>, AppError> {
        Ok(self
            .points
            .lock()
            .await
            .get(&(collection.to_string(), id))
            .cloned())
    }

    async fn delete(&self, collection: &str, id: Uuid) -> Result<(), AppError> {
        self.points.lock().await.remove(&(collection.to_string(), id));
        Ok(())
    }

    async fn ping(&self) -> Result<(), AppError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::embeddings::tests::{one_hot, record_with};
    use crate::models::Source;
    use chrono::Utc;

    fn sample_doc(kind: DocumentKind) -> Document {
        Document {
            id: Uuid::new_v4(),
            kind,
            blob_ref: "s3://uploads/abc".into(),
            content_hash: "deadbeef".into(),
            raw_text: "Jane Doe\n\n[EMAIL]\n\nRust engineer".into(),
            upload_time: Utc::now(),
            source: Source::Direct,
        }
    }

    fn sample_structured() -> Structured {
        let mut skills: Vec<String> = vec!["rust".into()];
        skills.resize(20, crate::models::PAD_SENTINEL.to_string());
        let mut resps: Vec<String> = vec!["Builds services.".into()];
        resps.resize(10, crate::models::PAD_SENTINEL.to_string());
        Structured {
            job_title: "Engineer".into(),
            category: "Software Engineering".into(),
            skills,
            responsibilities: resps,
            years_experience: 2.0,
            masked_pii: Default::default(),
        }
    }

    #[test]
    fn test_collection_names() {
        assert_eq!(Collection::Documents.name(DocumentKind::Cv), "cv_documents");
        assert_eq!(
            Collection::Embeddings.name(DocumentKind::Jd),
            "jd_embeddings"
        );
        assert_eq!(Collection::all_names().len(), 6);
    }

    #[test]
    fn test_gzip_roundtrip() {
        let text = "resume text ".repeat(100);
        let packed = gzip_b64(&text).unwrap();
        assert!(packed.len() < text.len());
        assert_eq!(gunzip_b64(&packed).unwrap(), text);
    }

    #[tokio::test]
    async fn test_document_roundtrip_preserves_text() {
        let store = DocStore::new(Arc::new(MemoryVectorDb::default()));
        let doc = sample_doc(DocumentKind::Cv);
        store.put_document(DocumentKind::Cv, &doc).await.unwrap();
        let back = store
            .get_document(DocumentKind::Cv, doc.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back.raw_text, doc.raw_text);
        assert_eq!(back.content_hash, doc.content_hash);
    }

    #[tokio::test]
    async fn test_embeddings_roundtrip_exact() {
        let store = DocStore::new(Arc::new(MemoryVectorDb::default()));
        let id = Uuid::new_v4();
        let record = record_with(vec![one_hot(0)], vec![one_hot(1)], one_hot(2), one_hot(3));
        store
            .put_embeddings_inner(DocumentKind::Jd, id, &record)
            .await
            .unwrap();
        let back = store
            .get_embeddings(DocumentKind::Jd, id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn test_put_is_upsert() {
        let store = DocStore::new(Arc::new(MemoryVectorDb::default()));
        let mut doc = sample_doc(DocumentKind::Cv);
        store.put_document(DocumentKind::Cv, &doc).await.unwrap();
        doc.blob_ref = "s3://uploads/def".into();
        store.put_document(DocumentKind::Cv, &doc).await.unwrap();
        let back = store
            .get_document(DocumentKind::Cv, doc.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(back.blob_ref, "s3://uploads/def");
    }

    #[tokio::test]
    async fn test_delete_doc_clears_all_mirrors_and_retries() {
        let store = DocStore::new(Arc::new(MemoryVectorDb::default()));
        let doc = sample_doc(DocumentKind::Cv);
        let record = record_with(vec![one_hot(0)], vec![], one_hot(1), one_hot(2));
        store
            .put_all(DocumentKind::Cv, &doc, &sample_structured(), &record)
            .await
            .unwrap();

        store.delete_doc(DocumentKind::Cv, doc.id).await.unwrap();
        assert!(store
            .get_document(DocumentKind::Cv, doc.id)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_structured(DocumentKind::Cv, doc.id)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_embeddings(DocumentKind::Cv, doc.id)
            .await
            .unwrap()
            .is_none());

        // Retry of a completed delete is a no-op, not an error.
        store.delete_doc(DocumentKind::Cv, doc.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = DocStore::new(Arc::new(MemoryVectorDb::default()));
        assert!(store
            .get_embeddings(DocumentKind::Jd, Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }
}
