//! Job posting management: the link between a JD and the subject code the
//! mail ingestor routes on.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::db;
use crate::errors::AppError;
use crate::models::{DocumentKind, JobPosting, SubjectCode};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreatePostingRequest {
    pub jd_id: Uuid,
    pub subject_code: String,
    pub created_by: Uuid,
}

/// POST /postings
///
/// The JD must already be ingested; the subject code must be unique and
/// well-formed.
pub async fn handle_create_posting(
    State(state): State<AppState>,
    Json(request): Json<CreatePostingRequest>,
) -> Result<(StatusCode, Json<JobPosting>), AppError> {
    let subject_code = SubjectCode::parse(&request.subject_code)?;

    if state
        .store
        .get_document(DocumentKind::Jd, request.jd_id)
        .await?
        .is_none()
    {
        return Err(AppError::NotFound(format!("JD {}", request.jd_id)));
    }
    if db::get_posting_by_subject_code(&state.db, &subject_code)
        .await?
        .is_some()
    {
        return Err(AppError::Validation(format!(
            "subject code {subject_code} is already in use"
        )));
    }

    let posting = JobPosting {
        posting_id: Uuid::new_v4(),
        jd_id: request.jd_id,
        public_token: Uuid::new_v4().simple().to_string(),
        subject_code,
        active: true,
        created_at: Utc::now(),
        created_by: request.created_by,
        applications: vec![],
    };
    db::insert_posting(&state.db, &posting).await?;

    Ok((StatusCode::CREATED, Json(posting)))
}

/// GET /postings/:id — the posting and its applications.
pub async fn handle_get_posting(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobPosting>, AppError> {
    db::get_posting(&state.db, id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("posting {id}")))
}
