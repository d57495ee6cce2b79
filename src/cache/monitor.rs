//! Cache health monitoring.
//!
//! Produces the snapshot surfaced as `X-Cache-*` headers by the optional
//! middleware and by the health endpoint.

use std::time::Duration;

use serde::Serialize;

use super::CacheService;

/// Hit-ratio below this is a warning.
const HIT_RATIO_WARNING: f64 = 0.5;
/// Hit-ratio below this is critical.
const HIT_RATIO_CRITICAL: f64 = 0.3;
/// Ping latency above this is a warning.
const LATENCY_WARNING: Duration = Duration::from_millis(100);
/// Ping latency above this is critical.
const LATENCY_CRITICAL: Duration = Duration::from_millis(500);

/// Overall cache backend status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Healthy,
    Disconnected,
    Error,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }
}

/// Point-in-time cache health.
#[derive(Debug, Clone, Serialize)]
pub struct CacheHealthSnapshot {
    pub status: CacheStatus,
    pub latency_ms: Option<u64>,
    pub hit_ratio: f64,
    pub recommendation: String,
}

/// Monitors the cache service and produces health snapshots.
#[derive(Clone)]
pub struct CacheMonitor {
    cache: CacheService,
}

impl CacheMonitor {
    pub fn new(cache: CacheService) -> Self {
        Self { cache }
    }

    /// Take a health snapshot: ping latency, hit ratio, and a recommendation.
    pub async fn snapshot(&self) -> CacheHealthSnapshot {
        let stats = self.cache.stats();
        let hit_ratio = stats.hit_ratio();

        if !self.cache.is_configured() {
            return CacheHealthSnapshot {
                status: CacheStatus::Disconnected,
                latency_ms: None,
                hit_ratio,
                recommendation: "No cache backend configured; all reads fall through to source"
                    .to_string(),
            };
        }

        match self.cache.ping().await {
            Ok(latency) => CacheHealthSnapshot {
                status: CacheStatus::Healthy,
                latency_ms: Some(latency.as_millis() as u64),
                hit_ratio,
                recommendation: recommendation(hit_ratio, latency),
            },
            Err(_) => CacheHealthSnapshot {
                status: CacheStatus::Error,
                latency_ms: None,
                hit_ratio,
                recommendation: "Cache backend unreachable; requests are served from source"
                    .to_string(),
            },
        }
    }
}

fn recommendation(hit_ratio: f64, latency: Duration) -> String {
    if hit_ratio < HIT_RATIO_CRITICAL {
        return format!(
            "Hit ratio critically low ({:.0}%); review cache keys and TTL tiers",
            hit_ratio * 100.0
        );
    }
    if latency > LATENCY_CRITICAL {
        return format!(
            "Cache latency critically high ({}ms); check backend load",
            latency.as_millis()
        );
    }
    if hit_ratio < HIT_RATIO_WARNING {
        return format!(
            "Hit ratio low ({:.0}%); consider longer TTLs for hot resources",
            hit_ratio * 100.0
        );
    }
    if latency > LATENCY_WARNING {
        return format!("Cache latency elevated ({}ms)", latency.as_millis());
    }
    "Cache operating normally".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheService, MemoryBackend, TTL_DEFAULT};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_disconnected_when_unconfigured() {
        let monitor = CacheMonitor::new(CacheService::disabled());
        let snapshot = monitor.snapshot().await;

        assert_eq!(snapshot.status, CacheStatus::Disconnected);
        assert!(snapshot.latency_ms.is_none());
    }

    #[tokio::test]
    async fn test_healthy_with_memory_backend() {
        let cache = CacheService::new(Arc::new(MemoryBackend::new()));
        let monitor = CacheMonitor::new(cache.clone());

        // Generate some traffic so the ratio reflects real lookups
        let _: u32 = cache
            .get_or_fetch("k", TTL_DEFAULT, || async { Ok(1) })
            .await
            .unwrap();
        let _: u32 = cache
            .get_or_fetch("k", TTL_DEFAULT, || async { Ok(1) })
            .await
            .unwrap();

        let snapshot = monitor.snapshot().await;
        assert_eq!(snapshot.status, CacheStatus::Healthy);
        assert!(snapshot.latency_ms.is_some());
        assert!((snapshot.hit_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_recommendation_thresholds() {
        let fast = Duration::from_millis(5);
        assert!(recommendation(0.2, fast).contains("critically low"));
        assert!(recommendation(0.4, fast).contains("Hit ratio low"));
        assert!(recommendation(0.9, Duration::from_millis(600)).contains("critically high"));
        assert!(recommendation(0.9, Duration::from_millis(150)).contains("elevated"));
        assert_eq!(recommendation(0.9, fast), "Cache operating normally");
    }
}
