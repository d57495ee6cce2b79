//! Read-through caching for tenant-scoped API data.
//!
//! The cache is an optimization only: every operation must be correct
//! (though possibly slower) when the backend is absent or failing. Backend
//! errors degrade to calling the fetcher directly and are never surfaced to
//! callers.

pub mod monitor;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// TTL tiers. Callers pick a tier instead of inventing ad-hoc durations.
pub const TTL_SHORT: Duration = Duration::from_secs(60);
pub const TTL_DEFAULT: Duration = Duration::from_secs(300);
pub const TTL_LONG: Duration = Duration::from_secs(3600);

/// Well-known organization-scoped resources cleared by bulk invalidation.
///
/// Bulk invalidation deletes exactly these keys; it does not discover keys
/// dynamically. A new cached resource type must be added here or it will
/// never be invalidated in bulk.
pub const ORG_CACHED_RESOURCES: &[&str] =
    &["settings", "members", "stats", "classes", "memberships"];

/// A pluggable key-value cache backend.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn ping(&self) -> Result<()>;

    /// Backend name for logs and the health monitor.
    fn name(&self) -> &'static str;
}

// =============================================================================
// In-memory backend
// =============================================================================

#[derive(Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// In-memory backend for tests and single-node deployments.
pub struct MemoryBackend {
    cache: MokaCache<String, MemoryEntry>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(max_capacity: u64) -> Self {
        Self {
            cache: MokaCache::builder().max_capacity(max_capacity).build(),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.cache.get(key).await {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value)),
            Some(_) => {
                self.cache.invalidate(key).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.cache
            .insert(
                key.to_string(),
                MemoryEntry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// =============================================================================
// Redis backend
// =============================================================================

/// Redis-backed cache for multi-node deployments.
pub struct RedisBackend {
    manager: redis::aio::ConnectionManager,
}

impl RedisBackend {
    /// Connect to Redis at the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// =============================================================================
// Cache decorator
// =============================================================================

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    bypasses: AtomicU64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
}

impl CacheStats {
    /// Hit ratio over lookups that actually consulted the backend.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            1.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Read-through cache decorator over an optional backend.
#[derive(Clone)]
pub struct CacheService {
    backend: Option<Arc<dyn CacheBackend>>,
    counters: Arc<CacheCounters>,
}

impl CacheService {
    /// Cache service with no backend: every lookup calls the fetcher.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            counters: Arc::new(CacheCounters::default()),
        }
    }

    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend: Some(backend),
            counters: Arc::new(CacheCounters::default()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    /// Backend name, for the health monitor.
    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    /// Return the cached value for `key`, or compute it with `fetcher`.
    ///
    /// Fresh values are written back best-effort. Backend read/write errors
    /// and deserialization failures degrade to the fetcher and are logged,
    /// never raised.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if key.is_empty() {
            return Err(Error::Validation("cache key must not be empty".to_string()));
        }
        if ttl.is_zero() {
            return Err(Error::Validation(
                "cache ttl must be greater than zero".to_string(),
            ));
        }

        let Some(backend) = &self.backend else {
            self.counters.bypasses.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_cache_request("bypass");
            return fetcher().await;
        };

        match backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_cache_request("hit");
                    debug!(key, "cache hit");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(key, error = %e, "cached value failed to deserialize, treating as miss");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(key, error = %e, "cache read failed, falling through to fetcher");
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_request("miss");

        let value = fetcher().await?;

        match serde_json::to_string(&value) {
            Ok(raw) => {
                if let Err(e) = backend.set(key, &raw, ttl).await {
                    warn!(key, error = %e, "cache write failed");
                }
            }
            Err(e) => {
                warn!(key, error = %e, "value not serializable for caching");
            }
        }

        Ok(value)
    }

    /// Build an organization-scoped key: `org:{organization_id}:{resource}`.
    pub fn org_key(organization_id: &str, resource: &str) -> String {
        format!("org:{}:{}", organization_id, resource)
    }

    /// Build a user-scoped key: `user:{user_id}:{resource}`.
    pub fn user_key(user_id: &str, resource: &str) -> String {
        format!("user:{}:{}", user_id, resource)
    }

    /// Organization-scoped convenience wrapper around [`get_or_fetch`].
    ///
    /// [`get_or_fetch`]: CacheService::get_or_fetch
    pub async fn get_or_fetch_org<T, F, Fut>(
        &self,
        organization_id: &str,
        resource: &str,
        ttl: Duration,
        fetcher: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.get_or_fetch(&Self::org_key(organization_id, resource), ttl, fetcher)
            .await
    }

    /// User-scoped convenience wrapper around [`get_or_fetch`].
    ///
    /// [`get_or_fetch`]: CacheService::get_or_fetch
    pub async fn get_or_fetch_user<T, F, Fut>(
        &self,
        user_id: &str,
        resource: &str,
        ttl: Duration,
        fetcher: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.get_or_fetch(&Self::user_key(user_id, resource), ttl, fetcher)
            .await
    }

    /// Best-effort single-key invalidation.
    pub async fn invalidate(&self, key: &str) {
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.delete(key).await {
                warn!(key, error = %e, "cache invalidation failed");
            }
        }
    }

    /// Delete every well-known cached resource for an organization.
    ///
    /// Covers only the enumerated [`ORG_CACHED_RESOURCES`] list.
    pub async fn invalidate_organization(&self, organization_id: &str) {
        for resource in ORG_CACHED_RESOURCES {
            self.invalidate(&Self::org_key(organization_id, resource))
                .await;
        }
    }

    /// Snapshot of hit/miss/bypass counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            bypasses: self.counters.bypasses.load(Ordering::Relaxed),
        }
    }

    /// Ping the backend, returning round-trip latency.
    pub async fn ping(&self) -> Result<Duration> {
        let Some(backend) = &self.backend else {
            return Err(Error::Cache("no cache backend configured".to_string()));
        };
        let start = Instant::now();
        backend.ping().await?;
        Ok(start.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// Backend wrapper that can be switched into a failing mode.
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl FlakyBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(Error::Cache("simulated read failure".to_string()));
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::Cache("simulated write failure".to_string()));
            }
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_second_call_is_a_hit() {
        let cache = CacheService::new(Arc::new(MemoryBackend::new()));
        let calls = Arc::new(AtomicU64::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let value: String = cache
                .get_or_fetch("org:1:settings", TTL_DEFAULT, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("computed".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "computed");
        }

        // Fetcher invoked at most once; second call served from cache
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_read_failure_recomputes_without_error() {
        let backend = Arc::new(FlakyBackend::new());
        let cache = CacheService::new(backend.clone());

        let value: String = cache
            .get_or_fetch("k", TTL_DEFAULT, || async { Ok("v1".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "v1");

        // Force the second call's read to error: the decorator must still
        // return the correct value by recomputing, never throwing.
        backend.fail_reads.store(true, Ordering::SeqCst);
        let value: String = cache
            .get_or_fetch("k", TTL_DEFAULT, || async { Ok("v1".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "v1");
    }

    #[tokio::test]
    async fn test_write_failure_is_silent() {
        let backend = Arc::new(FlakyBackend::new());
        backend.fail_writes.store(true, Ordering::SeqCst);
        let cache = CacheService::new(backend);

        let value: u32 = cache
            .get_or_fetch("k", TTL_DEFAULT, || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_no_backend_bypasses() {
        let cache = CacheService::disabled();
        let calls = Arc::new(AtomicU64::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let _: u32 = cache
                .get_or_fetch("k", TTL_DEFAULT, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await
                .unwrap();
        }

        // Every call falls through without a backend
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().bypasses, 2);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let cache = CacheService::new(Arc::new(MemoryBackend::new()));
        let result: Result<u32> = cache.get_or_fetch("", TTL_DEFAULT, || async { Ok(1) }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_entry_treated_as_miss() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set("k", "not json {", TTL_DEFAULT).await.unwrap();
        let cache = CacheService::new(backend);

        #[derive(Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Settings {
            name: String,
        }

        let value: Settings = cache
            .get_or_fetch("k", TTL_DEFAULT, || async {
                Ok(Settings {
                    name: "fresh".to_string(),
                })
            })
            .await
            .unwrap();
        assert_eq!(value.name, "fresh");
    }

    #[tokio::test]
    async fn test_memory_backend_expiry() {
        let backend = MemoryBackend::new();
        backend
            .set("k", "v", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backend.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scoped_keys_and_org_invalidation() {
        assert_eq!(CacheService::org_key("org-1", "settings"), "org:org-1:settings");
        assert_eq!(CacheService::user_key("u-1", "profile"), "user:u-1:profile");

        let backend = Arc::new(MemoryBackend::new());
        let cache = CacheService::new(backend.clone());

        for resource in ORG_CACHED_RESOURCES {
            backend
                .set(&CacheService::org_key("org-1", resource), "x", TTL_DEFAULT)
                .await
                .unwrap();
        }
        // A key outside the enumerated list survives bulk invalidation
        backend
            .set("org:org-1:bespoke", "x", TTL_DEFAULT)
            .await
            .unwrap();

        cache.invalidate_organization("org-1").await;

        for resource in ORG_CACHED_RESOURCES {
            assert!(backend
                .get(&CacheService::org_key("org-1", resource))
                .await
                .unwrap()
                .is_none());
        }
        assert!(backend.get("org:org-1:bespoke").await.unwrap().is_some());
    }

    #[test]
    fn test_hit_ratio() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            bypasses: 0,
        };
        assert!((stats.hit_ratio() - 0.75).abs() < f64::EPSILON);

        let empty = CacheStats {
            hits: 0,
            misses: 0,
            bypasses: 5,
        };
        assert!((empty.hit_ratio() - 1.0).abs() < f64::EPSILON);
    }
}
