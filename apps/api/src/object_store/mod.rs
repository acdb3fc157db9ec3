//! Object store adapter: original upload blobs live here, keyed by a URI
//! the core hands out once at ingest and never dereferences twice.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use tokio::sync::Mutex;

use crate::errors::AppError;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), AppError>;
    async fn get(&self, key: &str) -> Result<Bytes, AppError>;
    async fn delete(&self, key: &str) -> Result<(), AppError>;
}

/// S3 / MinIO implementation.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), AppError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| AppError::StoreUnavailable(format!("s3 put {key}: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, AppError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| AppError::StoreUnavailable(format!("s3 get {key}: {e}")))?;
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| AppError::StoreUnavailable(format!("s3 read {key}: {e}")))?;
        Ok(data.into_bytes())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| AppError::StoreUnavailable(format!("s3 delete {key}: {e}")))?;
        Ok(())
    }
}

/// In-memory implementation for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryObjectStore {
    blobs: Mutex<HashMap<String, Bytes>>,
}

#[cfg(test)]
#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Bytes) -> Result<(), AppError> {
        self.blobs.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, AppError> {
        self.blobs
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("blob {key}")))
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.blobs.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryObjectStore::default();
        store.put("uploads/a", Bytes::from_static(b"pdf bytes")).await.unwrap();
        assert_eq!(store.get("uploads/a").await.unwrap(), Bytes::from_static(b"pdf bytes"));
        store.delete("uploads/a").await.unwrap();
        assert!(store.get("uploads/a").await.is_err());
    }
}
