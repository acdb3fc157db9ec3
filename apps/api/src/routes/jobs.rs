//! Job progress lookup.

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::AppError;
use crate::state::AppState;

/// DELETE /job/:id — request-scoped cancellation. Queued jobs drop on the
/// next maintenance pass; running jobs observe their token.
pub async fn handle_cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let record = state
        .queue
        .record(id)
        .ok_or_else(|| AppError::NotFound(format!("job {id}")))?;
    if record.status.is_terminal() {
        return Err(AppError::Validation(format!(
            "job {id} already reached {:?}",
            record.status
        )));
    }
    state.queue.cancel_job(id);
    Ok(Json(json!({ "cancelling": id })))
}

/// GET /job/:id — status, checkpoint progress, and the result or error of
/// a terminal job.
pub async fn handle_get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, AppError> {
    let record = state
        .queue
        .record(id)
        .ok_or_else(|| AppError::NotFound(format!("job {id}")))?;

    Ok(Json(json!({
        "job_id": record.job.id,
        "kind": record.job.kind,
        "priority": record.job.priority,
        "status": record.status,
        "attempts": record.job.attempts,
        "checkpoint": record.checkpoint,
        "created_at": record.job.created_at,
        "error": record.error,
        "result": record.result,
    })))
}
