use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
///
/// Liveness plus per-adapter readiness. The process is alive if this
/// handler answers; each adapter reports its own state.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let postgres = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => "ok",
        Err(_) => "down",
    };
    let vector_store = match state.store.ping().await {
        Ok(_) => "ok",
        Err(_) => "down",
    };
    // The cache degrades to local-only on shared-tier failure, so a probe
    // write/read is always expected to succeed.
    let cache = {
        state
            .cache
            .set("health:probe", "1", std::time::Duration::from_secs(5))
            .await;
        match state.cache.get("health:probe").await.as_deref() {
            Some("1") => "ok",
            _ => "down",
        }
    };

    let ready = [postgres, vector_store, cache].iter().all(|s| *s == "ok");
    Json(json!({
        "status": if ready { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "service": "talentum-api",
        "adapters": {
            "postgres": postgres,
            "vector_store": vector_store,
            "cache": cache,
        },
        "queue_depth": state.queue.depth(),
    }))
}
