//! Document lookup and deletion.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Document, DocumentKind, Structured};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct DocResponse {
    pub id: Uuid,
    pub kind: DocumentKind,
    pub content_hash: String,
    pub upload_time: chrono::DateTime<chrono::Utc>,
    pub source: crate::models::Source,
    pub structured: Option<Structured>,
}

/// Ids are globally unique across kinds, so a lookup probes both mirrors.
async fn resolve(
    state: &AppState,
    id: Uuid,
) -> Result<Option<(DocumentKind, Document)>, AppError> {
    for kind in [DocumentKind::Cv, DocumentKind::Jd] {
        if let Some(doc) = state.store.get_document(kind, id).await? {
            return Ok(Some((kind, doc)));
        }
    }
    Ok(None)
}

/// GET /doc/:id — structured record plus document metadata.
pub async fn handle_get_doc(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DocResponse>, AppError> {
    let (kind, document) = resolve(&state, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {id}")))?;
    let structured = state.store.get_structured(kind, id).await?;

    Ok(Json(DocResponse {
        id: document.id,
        kind,
        content_hash: document.content_hash,
        upload_time: document.upload_time,
        source: document.source,
        structured,
    }))
}

/// DELETE /doc/:id — cascades to all three mirrors, the PII side map, and
/// the blob; applications referencing a CV are soft-orphaned.
pub async fn handle_delete_doc(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let (kind, _) = resolve(&state, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("document {id}")))?;
    state.orchestrator.delete_document(kind, id).await?;
    Ok(Json(json!({ "deleted": id })))
}
