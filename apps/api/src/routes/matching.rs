//! Match endpoints: single pair and bulk.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::errors::AppError;
use crate::ingest::BulkMatchEntry;
use crate::matcher::Score;
use crate::queue::{JobKind, Priority};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MatchRequest {
    pub jd_id: Uuid,
    pub cv_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct MatchResponse {
    pub jd_id: Uuid,
    pub cv_id: Uuid,
    pub score: Score,
    pub weights_version: String,
}

/// POST /match
pub async fn handle_match(
    State(state): State<AppState>,
    Json(request): Json<MatchRequest>,
) -> Result<Json<MatchResponse>, AppError> {
    let score = state
        .matcher
        .match_pair(request.jd_id, request.cv_id)
        .await?;
    Ok(Json(MatchResponse {
        jd_id: request.jd_id,
        cv_id: request.cv_id,
        score,
        weights_version: state.matcher.weights_version().to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct BulkMatchRequest {
    pub jd_id: Uuid,
    pub cv_ids: Vec<Uuid>,
    /// When set, the bulk runs as a queue job; poll `GET /job/{id}` for the
    /// ranked result instead of waiting on this request.
    #[serde(default)]
    pub enqueue: bool,
}

#[derive(Debug, Serialize)]
pub struct BulkMatchResponse {
    pub jd_id: Uuid,
    pub results: Vec<BulkMatchEntry>,
    pub weights_version: String,
}

/// POST /match/bulk
///
/// Ranked descending by overall score, ties broken by CV id; CVs without
/// embeddings trail the list with an error instead of a fabricated score.
pub async fn handle_bulk_match(
    State(state): State<AppState>,
    Json(request): Json<BulkMatchRequest>,
) -> Result<Response, AppError> {
    if request.cv_ids.is_empty() {
        return Err(AppError::Validation("cv_ids cannot be empty".to_string()));
    }
    if request.cv_ids.len() > 5000 {
        return Err(AppError::Validation(
            "cv_ids exceeds the 5000-CV bulk limit".to_string(),
        ));
    }

    if request.enqueue {
        let job_id = state
            .queue
            .submit(
                JobKind::BulkMatch,
                Priority::Normal,
                json!({ "jd_id": request.jd_id, "cv_ids": request.cv_ids }),
                format!("bulk:{}", Uuid::new_v4()),
                None,
            )
            .await?;
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "jd_id": request.jd_id, "job_id": job_id })),
        )
            .into_response());
    }

    let results = state
        .orchestrator
        .bulk_match(request.jd_id, &request.cv_ids)
        .await?;
    Ok(Json(BulkMatchResponse {
        jd_id: request.jd_id,
        results,
        weights_version: state.matcher.weights_version().to_string(),
    })
    .into_response())
}
