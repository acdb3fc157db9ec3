//! Two-tier cache: process-local LRU in front of a shared Redis tier.
//!
//! Reads hit local first. Writes go local-then-shared. A shared-tier outage
//! degrades the system to local-only with one warning log; correctness is
//! unaffected because every cached value can be recomputed.

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::errors::AppError;

/// TTL for per-phrase embedding vectors (`emb:` namespace).
pub const EMB_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// TTL for extraction results (`ext:` namespace).
pub const EXT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// TTL for match scores (`match:` namespace).
pub const MATCH_TTL: Duration = Duration::from_secs(30 * 60);

const LOCAL_CAPACITY: u64 = 100_000;

/// Key for a cached phrase vector.
pub fn emb_key(model_id: &str, text_hash: &str) -> String {
    format!("emb:{model_id}:{text_hash}")
}

/// Key for a cached extraction.
pub fn ext_key(prompt_version: &str, model_id: &str, content_hash: &str) -> String {
    format!("ext:{prompt_version}:{model_id}:{content_hash}")
}

/// Key for a cached match score. `weights_version` participates so weight
/// changes never serve stale scores.
pub fn match_key(jd_id: &uuid::Uuid, cv_id: &uuid::Uuid, weights_version: &str) -> String {
    format!("match:{jd_id}:{cv_id}:{weights_version}")
}

/// The shared (distributed) tier. Narrow so tests can substitute a double.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError>;
    async fn del(&self, key: &str) -> Result<(), AppError>;
}

/// Redis-backed shared tier.
pub struct RedisCache {
    client: redis::Client,
}

impl RedisCache {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::CacheUnavailable(e.to_string()))?;
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| AppError::CacheUnavailable(e.to_string()))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::CacheUnavailable(e.to_string()))?;
        let _: () = conn
            .set_ex(key, value, ttl.as_secs())
            .await
            .map_err(|e| AppError::CacheUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::CacheUnavailable(e.to_string()))?;
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| AppError::CacheUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[derive(Clone)]
struct LocalEntry {
    value: String,
    expires_at: Instant,
}

/// The cache facade handed to every component.
pub struct TieredCache {
    local: moka::future::Cache<String, LocalEntry>,
    shared: Option<Arc<dyn SharedCache>>,
    /// Set after the first shared-tier failure so the warning logs once.
    degraded: AtomicBool,
}

impl TieredCache {
    pub fn new(shared: Option<Arc<dyn SharedCache>>) -> Self {
        Self {
            local: moka::future::Cache::builder()
                .max_capacity(LOCAL_CAPACITY)
                .build(),
            shared,
            degraded: AtomicBool::new(false),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.local.get(key).await {
            if entry.expires_at > Instant::now() {
                return Some(entry.value);
            }
            self.local.invalidate(key).await;
        }

        let shared = self.shared.as_ref()?;
        match shared.get(key).await {
            Ok(Some(value)) => {
                // Re-warm local with a conservative residual TTL.
                self.local
                    .insert(
                        key.to_string(),
                        LocalEntry {
                            value: value.clone(),
                            expires_at: Instant::now() + MATCH_TTL,
                        },
                    )
                    .await;
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                self.warn_degraded(&e);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        self.local
            .insert(
                key.to_string(),
                LocalEntry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            )
            .await;

        if let Some(shared) = &self.shared {
            if let Err(e) = shared.set(key, value, ttl).await {
                self.warn_degraded(&e);
            }
        }
    }

    pub async fn del(&self, key: &str) {
        self.local.invalidate(key).await;
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.del(key).await {
                self.warn_degraded(&e);
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, ttl).await,
            Err(e) => warn!("Refusing to cache unserializable value at {key}: {e}"),
        }
    }

    fn warn_degraded(&self, e: &AppError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!("Shared cache unavailable, degrading to local-only: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    struct MapCache {
        map: Mutex<HashMap<String, String>>,
        fail: bool,
    }

    impl MapCache {
        fn new(fail: bool) -> Self {
            Self {
                map: Mutex::new(HashMap::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl SharedCache for MapCache {
        async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
            if self.fail {
                return Err(AppError::CacheUnavailable("down".into()));
            }
            Ok(self.map.lock().await.get(key).cloned())
        }

        async fn set(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), AppError> {
            if self.fail {
                return Err(AppError::CacheUnavailable("down".into()));
            }
            self.map
                .lock()
                .await
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn del(&self, key: &str) -> Result<(), AppError> {
            if self.fail {
                return Err(AppError::CacheUnavailable("down".into()));
            }
            self.map.lock().await.remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_local_roundtrip() {
        let cache = TieredCache::new(None);
        cache.set("k", "v", Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_local_expiry() {
        let cache = TieredCache::new(None);
        cache.set("k", "v", Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_shared_populated_on_write() {
        let shared = Arc::new(MapCache::new(false));
        let cache = TieredCache::new(Some(shared.clone()));
        cache.set("k", "v", Duration::from_secs(60)).await;
        assert_eq!(
            shared.map.lock().await.get("k").map(String::as_str),
            Some("v")
        );
    }

    #[tokio::test]
    async fn test_read_falls_back_to_shared() {
        let shared = Arc::new(MapCache::new(false));
        shared
            .map
            .lock()
            .await
            .insert("k".to_string(), "warm".to_string());
        let cache = TieredCache::new(Some(shared));
        assert_eq!(cache.get("k").await.as_deref(), Some("warm"));
    }

    #[tokio::test]
    async fn test_shared_outage_degrades_silently() {
        let cache = TieredCache::new(Some(Arc::new(MapCache::new(true))));
        cache.set("k", "v", Duration::from_secs(60)).await;
        // Local tier still serves the value despite shared failures.
        assert_eq!(cache.get("k").await.as_deref(), Some("v"));
        assert!(cache.degraded.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_del_removes_both_tiers() {
        let shared = Arc::new(MapCache::new(false));
        let cache = TieredCache::new(Some(shared.clone()));
        cache.set("k", "v", Duration::from_secs(60)).await;
        cache.del("k").await;
        assert_eq!(cache.get("k").await, None);
        assert!(shared.map.lock().await.get("k").is_none());
    }

    #[test]
    fn test_key_formats() {
        let jd = uuid::Uuid::nil();
        let cv = uuid::Uuid::nil();
        assert_eq!(emb_key("m1", "abc"), "emb:m1:abc");
        assert_eq!(ext_key("v3", "m1", "abc"), "ext:v3:m1:abc");
        assert_eq!(
            match_key(&jd, &cv, "w1"),
            format!("match:{jd}:{cv}:w1")
        );
    }
}
