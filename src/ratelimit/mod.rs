pub mod in_memory;

use std::{
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    config::RateLimitConfig,
    error::GatewayResult,
    router::prefix_matches,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitAlgorithm {
    /// Counter plus window start, reset lazily once the window has elapsed.
    /// Denied attempts still consume capacity.
    #[default]
    FixedWindow,
    /// Timestamps of admitted requests over the trailing window.
    SlidingWindow,
}

impl FromStr for RateLimitAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed_window" | "fixed" => Ok(Self::FixedWindow),
            "sliding_window" | "sliding" => Ok(Self::SlidingWindow),
            other => Err(format!("unsupported RATE_LIMIT_ALGORITHM: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleScope {
    Global,
    Route(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    pub scope: RuleScope,
    pub quota: u64,
    pub window: Duration,
}

impl RateLimitRule {
    pub fn global(quota: u64, window: Duration) -> Self {
        Self {
            scope: RuleScope::Global,
            quota,
            window,
        }
    }

    pub fn route(prefix: impl Into<String>, quota: u64, window: Duration) -> Self {
        Self {
            scope: RuleScope::Route(prefix.into()),
            quota,
            window,
        }
    }

    /// Stable label used to namespace counters per rule.
    pub fn id(&self) -> &str {
        match &self.scope {
            RuleScope::Global => "global",
            RuleScope::Route(prefix) => prefix,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_secs: u64,
}

#[async_trait]
pub trait RateLimitBackend: Send + Sync {
    async fn check(&self, key: &str, rule: &RateLimitRule) -> GatewayResult<RateLimitDecision>;

    /// Drops counters whose window has elapsed. Returns how many were removed.
    async fn purge_expired(&self) -> usize {
        0
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    backend: Arc<dyn RateLimitBackend>,
    default_rule: Option<RateLimitRule>,
    route_rules: Vec<RateLimitRule>,
}

impl RateLimiter {
    pub fn new(
        backend: Arc<dyn RateLimitBackend>,
        default_rule: Option<RateLimitRule>,
        route_rules: Vec<RateLimitRule>,
    ) -> Self {
        Self {
            backend,
            default_rule,
            route_rules,
        }
    }

    pub fn from_config(cfg: &RateLimitConfig, backend: Arc<dyn RateLimitBackend>) -> Self {
        let default_rule = RateLimitRule::global(cfg.default_quota.quota, cfg.default_quota.window);
        let route_rules = cfg
            .route_quotas
            .iter()
            .map(|r| RateLimitRule::route(r.path_prefix.clone(), r.quota.quota, r.quota.window))
            .collect();

        Self::new(backend, Some(default_rule), route_rules)
    }

    /// Rules applying to `path`, most specific first: the longest matching
    /// route rule, then the global rule.
    pub fn rules_for(&self, path: &str) -> Vec<&RateLimitRule> {
        let route_rule = self
            .route_rules
            .iter()
            .filter(|rule| prefix_matches(rule.id(), path))
            .max_by_key(|rule| rule.id().len());

        route_rule.into_iter().chain(self.default_rule.as_ref()).collect()
    }

    /// Admits only if every applicable rule admits. The first denial stops
    /// evaluation so less specific rules are not charged for a rejected request.
    pub async fn admit(&self, key: &str, path: &str) -> GatewayResult<RateLimitDecision> {
        let mut remaining = u64::MAX;

        for rule in self.rules_for(path) {
            let decision = self.backend.check(key, rule).await?;
            if !decision.allowed {
                tracing::debug!(
                    key = %key,
                    rule = rule.id(),
                    retry_after_secs = decision.retry_after_secs,
                    "rate limit rule denied request"
                );
                return Ok(decision);
            }
            remaining = remaining.min(decision.remaining);
        }

        Ok(RateLimitDecision {
            allowed: true,
            remaining: if remaining == u64::MAX { 0 } else { remaining },
            retry_after_secs: 0,
        })
    }

    pub async fn purge_expired(&self) -> usize {
        self.backend.purge_expired().await
    }
}

/// Periodically reclaims memory held by counters whose window has elapsed.
/// Expired counters are already treated as absent, so this only bounds memory.
pub fn spawn_reaper(limiter: RateLimiter, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = limiter.purge_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "reaped expired rate limit counters");
            }
        }
    })
}

pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}
