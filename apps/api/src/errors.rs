use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
///
/// Variants are grouped by the retry policy applied to them: input errors are
/// surfaced and never retried, upstream errors are retried at the call site,
/// data errors depend on the variant, control errors signal the caller, and
/// fatal errors halt the affected worker.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Input ──────────────────────────────────────────────────────────
    #[error("Unsupported document type: {0}")]
    UnsupportedType(String),

    #[error("Corrupt document: {0}")]
    Corrupt(String),

    #[error("Document too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Invalid subject code: {0}")]
    InvalidSubject(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // ── Upstream ───────────────────────────────────────────────────────
    #[error("Extractor throttled")]
    ExtractorThrottled,

    #[error("Extractor unavailable: {0}")]
    ExtractorUnavailable(String),

    #[error("Embedder unavailable: {0}")]
    EmbedderUnavailable(String),

    #[error("Vector store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    // ── Data ───────────────────────────────────────────────────────────
    #[error("Invalid extraction schema: {0}")]
    InvalidSchema(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimMismatch { expected: usize, got: usize },

    #[error("Missing embeddings for document {0}")]
    MissingEmbeddings(Uuid),

    // ── Control ────────────────────────────────────────────────────────
    #[error("Queue back-pressure at depth {depth}")]
    BackPressure { depth: usize },

    #[error("Duplicate submission, prior job {prior_job_id}")]
    IdempotencyCollision { prior_job_id: Uuid },

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Cancelled")]
    Cancelled,

    // ── Fatal ──────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// True for failures the queue retries with backoff.
    /// Input, data, and fatal errors never consume retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::ExtractorThrottled
                | AppError::ExtractorUnavailable(_)
                | AppError::EmbedderUnavailable(_)
                | AppError::StoreUnavailable(_)
                | AppError::DeadlineExceeded
        )
    }

    /// True for conditions that halt the worker and block supervisor
    /// scale-up until cleared.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::Config(_) | AppError::Invariant(_) | AppError::DimMismatch { .. }
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::UnsupportedType(msg) => {
                (StatusCode::BAD_REQUEST, "UNSUPPORTED_TYPE", msg.clone())
            }
            AppError::Corrupt(msg) => (StatusCode::BAD_REQUEST, "CORRUPT", msg.clone()),
            AppError::TooLarge { .. } => (StatusCode::BAD_REQUEST, "TOO_LARGE", self.to_string()),
            AppError::InvalidSubject(msg) => {
                (StatusCode::BAD_REQUEST, "INVALID_SUBJECT", msg.clone())
            }
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::IdempotencyCollision { prior_job_id } => {
                // 409 carries the prior job id so the caller can poll it.
                let body = Json(json!({
                    "error": {
                        "code": "IDEMPOTENCY_COLLISION",
                        "message": "An identical submission is already queued",
                        "prior_job_id": prior_job_id,
                    }
                }));
                return (StatusCode::CONFLICT, body).into_response();
            }
            AppError::MissingEmbeddings(id) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "NOT_SCORABLE",
                format!("Document {id} has no embeddings record"),
            ),
            AppError::BackPressure { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "BACK_PRESSURE",
                "Queue is full, retry with backoff".to_string(),
            ),
            AppError::ExtractorThrottled
            | AppError::ExtractorUnavailable(_)
            | AppError::EmbedderUnavailable(_)
            | AppError::StoreUnavailable(_)
            | AppError::CacheUnavailable(_)
            | AppError::InvalidSchema(_) => {
                tracing::error!("Upstream error: {self}");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "UPSTREAM_UNAVAILABLE",
                    "A dependency is unavailable".to_string(),
                )
            }
            AppError::DeadlineExceeded => (
                StatusCode::GATEWAY_TIMEOUT,
                "DEADLINE_EXCEEDED",
                "The request deadline passed".to_string(),
            ),
            AppError::Cancelled => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CANCELLED",
                "The request was cancelled".to_string(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::DimMismatch { .. } | AppError::Config(_) | AppError::Invariant(_) => {
                tracing::error!("Fatal error: {self}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INVARIANT_VIOLATION",
                    self.to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:?}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
