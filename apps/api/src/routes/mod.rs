pub mod docs;
pub mod health;
pub mod ingest;
pub mod jobs;
pub mod matching;
pub mod postings;

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use uuid::Uuid;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // ── Ingestion ──────────────────────────────────────────────────
        .route("/ingest/cv", post(ingest::handle_ingest_cv))
        .route("/ingest/jd", post(ingest::handle_ingest_jd))
        .route(
            "/doc/:id",
            get(docs::handle_get_doc).delete(docs::handle_delete_doc),
        )
        // ── Matching ───────────────────────────────────────────────────
        .route("/match", post(matching::handle_match))
        .route("/match/bulk", post(matching::handle_bulk_match))
        // ── Jobs & postings ────────────────────────────────────────────
        .route(
            "/job/:id",
            get(jobs::handle_get_job).delete(jobs::handle_cancel_job),
        )
        .route("/postings", post(postings::handle_create_posting))
        .route("/postings/:id", get(postings::handle_get_posting))
        .layer(middleware::from_fn(echo_request_id))
        // Uploads are capped at 10 MiB plus multipart framing headroom.
        .layer(DefaultBodyLimit::max(12 * 1024 * 1024))
        .with_state(state)
}

/// Echoes the caller's `x-request-id`, minting one when absent.
async fn echo_request_id(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}
