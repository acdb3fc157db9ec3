//! Qdrant-backed [`VectorDb`] over the REST API.
//!
//! Records ride entirely in point payloads; every point carries a one-dim
//! placeholder vector because the similarity index is reserved for future
//! top-k queries. All lookups are by point id.

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::errors::AppError;
use crate::store::{Collection, VectorDb};

/// Placeholder vector stored with every point.
const DUMMY_VECTOR: [f32; 1] = [0.0];

pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
}

impl QdrantStore {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("Failed to build HTTP client"),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Creates the six collections if absent. Existing collections are left
    /// untouched, so startup is idempotent.
    pub async fn ensure_collections(&self) -> Result<(), AppError> {
        for name in Collection::all_names() {
            let url = format!("{}/collections/{name}", self.base_url);
            let body = json!({
                "vectors": { "size": DUMMY_VECTOR.len(), "distance": "Dot" }
            });
            let response = self
                .client
                .put(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;

            // 409 means the collection already exists; anything else
            // non-2xx is a real failure.
            if !response.status().is_success() && response.status().as_u16() != 409 {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(AppError::StoreUnavailable(format!(
                    "create {name} failed, status {status}: {body}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VectorDb for QdrantStore {
    async fn put(&self, collection: &str, id: Uuid, payload: Value) -> Result<(), AppError> {
        let url = format!("{}/collections/{collection}/points?wait=true", self.base_url);
        let body = json!({
            "points": [{
                "id": id,
                "vector": DUMMY_VECTOR,
                "payload": payload,
            }]
        });
        let response = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::StoreUnavailable(format!(
                "put into {collection} failed, status {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<Value>, AppError> {
        let url = format!("{}/collections/{collection}/points/{id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::StoreUnavailable(format!(
                "get from {collection} failed, status {status}: {body}"
            )));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| AppError::StoreUnavailable(format!("bad reply: {e}")))?;
        Ok(reply
            .get("result")
            .and_then(|r| r.get("payload"))
            .cloned()
            .filter(|p| !p.is_null()))
    }

    async fn delete(&self, collection: &str, id: Uuid) -> Result<(), AppError> {
        let url = format!(
            "{}/collections/{collection}/points/delete?wait=true",
            self.base_url
        );
        let body = json!({ "points": [id] });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;

        // Deleting an absent point succeeds; qdrant treats it as a no-op.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::StoreUnavailable(format!(
                "delete from {collection} failed, status {status}: {body}"
            )));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), AppError> {
        let url = format!("{}/collections", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::StoreUnavailable(format!(
                "qdrant status {}",
                response.status()
            )))
        }
    }
}
