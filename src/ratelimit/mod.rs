//! Tenant-aware request rate limiting.
//!
//! Decides, per inbound request, whether to admit or reject based on an
//! identifier (organization id > user id > client IP, in that preference
//! order) and the tenant's subscription tier. Bucket accounting delegates to
//! [`bucket::BucketRegistry`]; this module owns identifier resolution, tier
//! lookup, and response shaping.
//!
//! When the accounting backend misbehaves the limiter **fails open**: the
//! request is admitted and a warning is logged. Dropping a request over a
//! broken limiter punishes tenants for an operational fault.

pub mod bucket;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::RateLimitTiersConfig;
use crate::storage::SqliteStorage;
use bucket::{BucketConfig, BucketRegistry};

/// Subscription tiers with distinct request budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }

    /// Map a stored plan name to a tier. Unknown plans get `Basic`.
    pub fn from_plan(plan: &str) -> Self {
        match plan {
            "pro" => Self::Pro,
            "enterprise" => Self::Enterprise,
            _ => Self::Basic,
        }
    }
}

/// Who is making the request, in decreasing preference order.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentity {
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
    pub ip: Option<String>,
}

impl RequestIdentity {
    pub fn for_organization(organization_id: &str) -> Self {
        Self {
            organization_id: Some(organization_id.to_string()),
            ..Default::default()
        }
    }

    /// Bucket key for this identity: organization > user > IP > anonymous.
    pub fn key(&self) -> String {
        if let Some(org) = &self.organization_id {
            format!("org:{}", org)
        } else if let Some(user) = &self.user_id {
            format!("user:{}", user)
        } else if let Some(ip) = &self.ip {
            format!("ip:{}", ip)
        } else {
            "anonymous".to_string()
        }
    }
}

/// Admission decision for one request.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// When the caller's budget is next usable (next token on rejection,
    /// end of the current window on admission)
    pub reset: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Seconds a rejected caller should wait, derived from `reset`.
    pub fn retry_after_secs(&self) -> u64 {
        (self.reset - Utc::now()).num_seconds().max(0) as u64
    }
}

/// Rate limiter service: tier lookup + bucket registry + decision shaping.
#[derive(Clone)]
pub struct RateLimitService {
    registry: Arc<BucketRegistry>,
    tiers: RateLimitTiersConfig,
    storage: Option<SqliteStorage>,
}

impl RateLimitService {
    pub fn new(tiers: RateLimitTiersConfig) -> Self {
        Self {
            registry: Arc::new(BucketRegistry::new()),
            tiers,
            storage: None,
        }
    }

    /// Attach storage so tiers resolve from the organization's stored plan.
    pub fn with_storage(mut self, storage: SqliteStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    fn limit_for(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Basic => self.tiers.basic_per_minute,
            Tier::Pro => self.tiers.pro_per_minute,
            Tier::Enterprise => self.tiers.enterprise_per_minute,
        }
    }

    /// Resolve the tier for an identity from the organization's stored plan.
    ///
    /// Unknown organizations, identities without an organization, and storage
    /// errors all default to `Basic`.
    pub async fn tier_for(&self, identity: &RequestIdentity) -> Tier {
        let (Some(storage), Some(org_id)) = (&self.storage, &identity.organization_id) else {
            return Tier::Basic;
        };

        match storage.get_organization(org_id).await {
            Ok(Some(org)) => Tier::from_plan(&org.plan_tier),
            Ok(None) => Tier::Basic,
            Err(e) => {
                debug!(organization_id = %org_id, error = %e, "tier lookup failed, defaulting to basic");
                Tier::Basic
            }
        }
    }

    /// Check one request against the identity's budget.
    pub async fn check(&self, identity: &RequestIdentity) -> RateLimitDecision {
        let tier = self.tier_for(identity).await;
        self.check_with_tier(identity, tier)
    }

    /// Check with a pre-resolved tier (used by tests and internal callers).
    pub fn check_with_tier(&self, identity: &RequestIdentity, tier: Tier) -> RateLimitDecision {
        let limit = self.limit_for(tier);
        let config = BucketConfig::per_minute(limit);
        let key = format!("{}:{}", tier.as_str(), identity.key());

        let outcome = self.registry.acquire(&key, &config);

        crate::metrics::record_rate_limit_decision(tier.as_str(), outcome.allowed);

        let reset = if outcome.allowed {
            Utc::now() + chrono::Duration::from_std(config.window).unwrap_or_else(|_| chrono::Duration::zero())
        } else {
            Utc::now()
                + chrono::Duration::from_std(outcome.retry_after.max(Duration::from_secs(1)))
                    .unwrap_or_else(|_| chrono::Duration::zero())
        };

        RateLimitDecision {
            allowed: outcome.allowed,
            limit,
            remaining: outcome.remaining,
            reset,
        }
    }

    /// Forget accumulated state (for tests).
    pub fn reset(&self) {
        self.registry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::Organization;

    fn tiers(basic: u32) -> RateLimitTiersConfig {
        RateLimitTiersConfig {
            basic_per_minute: basic,
            pro_per_minute: basic * 5,
            enterprise_per_minute: basic * 20,
        }
    }

    #[test]
    fn test_identity_preference_order() {
        let identity = RequestIdentity {
            organization_id: Some("org-1".to_string()),
            user_id: Some("u-1".to_string()),
            ip: Some("10.0.0.1".to_string()),
        };
        assert_eq!(identity.key(), "org:org-1");

        let identity = RequestIdentity {
            organization_id: None,
            user_id: Some("u-1".to_string()),
            ip: Some("10.0.0.1".to_string()),
        };
        assert_eq!(identity.key(), "user:u-1");

        let identity = RequestIdentity {
            organization_id: None,
            user_id: None,
            ip: Some("10.0.0.1".to_string()),
        };
        assert_eq!(identity.key(), "ip:10.0.0.1");

        assert_eq!(RequestIdentity::default().key(), "anonymous");
    }

    #[test]
    fn test_monotonic_exhaustion() {
        let service = RateLimitService::new(tiers(3));
        let identity = RequestIdentity::for_organization("org-1");

        let mut last_remaining = u32::MAX;
        for _ in 0..3 {
            let decision = service.check_with_tier(&identity, Tier::Basic);
            assert!(decision.allowed);
            assert_eq!(decision.limit, 3);
            assert!(decision.remaining < last_remaining);
            last_remaining = decision.remaining;
        }

        // Request N+1 within the window is rejected
        let decision = service.check_with_tier(&identity, Tier::Basic);
        assert!(!decision.allowed);
        assert!(decision.reset > Utc::now());
    }

    #[test]
    fn test_tiers_have_separate_budgets() {
        let service = RateLimitService::new(tiers(1));
        let identity = RequestIdentity::for_organization("org-1");

        assert!(service.check_with_tier(&identity, Tier::Basic).allowed);
        assert!(!service.check_with_tier(&identity, Tier::Basic).allowed);

        // Pro budget is independent and larger
        let decision = service.check_with_tier(&identity, Tier::Pro);
        assert!(decision.allowed);
        assert_eq!(decision.limit, 5);
    }

    #[test]
    fn test_tier_from_plan_defaults_to_basic() {
        assert_eq!(Tier::from_plan("pro"), Tier::Pro);
        assert_eq!(Tier::from_plan("enterprise"), Tier::Enterprise);
        assert_eq!(Tier::from_plan("basic"), Tier::Basic);
        assert_eq!(Tier::from_plan("unknown-plan"), Tier::Basic);
        assert_eq!(Tier::from_plan(""), Tier::Basic);
    }

    #[tokio::test]
    async fn test_tier_lookup_from_storage() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .create_organization(&Organization {
                id: "org-pro".to_string(),
                name: "Pro Gym".to_string(),
                plan_tier: "pro".to_string(),
                webhook_secret: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let service = RateLimitService::new(tiers(10)).with_storage(storage);

        let tier = service
            .tier_for(&RequestIdentity::for_organization("org-pro"))
            .await;
        assert_eq!(tier, Tier::Pro);

        // Unknown organization defaults to basic
        let tier = service
            .tier_for(&RequestIdentity::for_organization("org-nope"))
            .await;
        assert_eq!(tier, Tier::Basic);

        // No organization in the identity defaults to basic
        let tier = service.tier_for(&RequestIdentity::default()).await;
        assert_eq!(tier, Tier::Basic);
    }

    #[test]
    fn test_retry_after_secs_never_negative() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset: Utc::now() - chrono::Duration::seconds(5),
        };
        assert_eq!(decision.retry_after_secs(), 0);
    }
}
