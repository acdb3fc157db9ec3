//! Axum route handlers for document ingestion.

use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{DocumentKind, Source};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub document_id: Uuid,
    pub job_id: Option<Uuid>,
    pub aliased: bool,
}

/// POST /ingest/cv
///
/// Multipart upload of one CV. Returns 202 with the document id and the
/// pipeline job id; identical content short-circuits to an alias with no
/// job.
pub async fn handle_ingest_cv(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    handle_upload(state, multipart, DocumentKind::Cv).await
}

/// POST /ingest/jd
pub async fn handle_ingest_jd(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    handle_upload(state, multipart, DocumentKind::Jd).await
}

async fn handle_upload(
    state: AppState,
    mut multipart: Multipart,
    kind: DocumentKind,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    let mut file: Option<(bytes::Bytes, String)> = None;
    let mut source = Source::Direct;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("bad multipart body: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let mime = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("failed to read upload: {e}")))?;
                file = Some((bytes, mime));
            }
            Some("source") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| AppError::Validation(format!("bad source field: {e}")))?;
                source = match raw.as_str() {
                    "direct" => Source::Direct,
                    "bulk_import" => Source::BulkImport,
                    other => {
                        return Err(AppError::Validation(format!("unknown source '{other}'")))
                    }
                };
            }
            _ => {}
        }
    }

    let (bytes, mime) = file.ok_or_else(|| {
        AppError::Validation("multipart field 'file' is required".to_string())
    })?;

    let receipt = state
        .orchestrator
        .submit_upload(&state.queue, kind, bytes, &mime, source)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            document_id: receipt.document_id,
            job_id: receipt.job_id,
            aliased: receipt.aliased,
        }),
    ))
}
