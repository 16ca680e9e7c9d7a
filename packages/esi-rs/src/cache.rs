//! Response cache seam.
//!
//! The client consults a `ResponseCache` before every request and stores
//! validators (entity tag, expiry, last-modified) alongside the decoded
//! body. The trait keeps the client storage-agnostic; the server backs it
//! with Postgres and tests use the in-memory implementation.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// One cached upstream response, keyed externally by cache key.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub etag: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_modified: Option<String>,
    pub body: serde_json::Value,
}

impl CacheEntry {
    /// Fresh entries are served without touching the network.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if expires > now)
    }
}

#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Upsert by key.
    async fn put(&self, key: &str, entry: CacheEntry) -> Result<()>;
}

/// In-memory cache for tests and cache-less deployments.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, entry: CacheEntry) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(expires_at: Option<DateTime<Utc>>) -> CacheEntry {
        CacheEntry {
            etag: Some("\"abc\"".into()),
            expires_at,
            last_modified: None,
            body: serde_json::json!({"name": "Jita"}),
        }
    }

    #[test]
    fn entry_with_future_expiry_is_fresh() {
        let e = entry(Some(Utc::now() + chrono::Duration::minutes(5)));
        assert!(e.is_fresh(Utc::now()));
    }

    #[test]
    fn expired_or_unset_entry_is_stale() {
        let past = entry(Some(Utc::now() - chrono::Duration::minutes(5)));
        assert!(!past.is_fresh(Utc::now()));
        assert!(!entry(None).is_fresh(Utc::now()));
    }

    #[tokio::test]
    async fn memory_cache_round_trips() {
        let cache = MemoryCache::new();
        assert!(cache.get("k").await.unwrap().is_none());

        cache.put("k", entry(None)).await.unwrap();
        let got = cache.get("k").await.unwrap().unwrap();
        assert_eq!(got.etag.as_deref(), Some("\"abc\""));

        // Second put replaces.
        let mut replacement = entry(None);
        replacement.etag = Some("\"def\"".into());
        cache.put("k", replacement).await.unwrap();
        let got = cache.get("k").await.unwrap().unwrap();
        assert_eq!(got.etag.as_deref(), Some("\"def\""));
    }
}
