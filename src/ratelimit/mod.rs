use std::{
    fmt,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use crate::{
    error::GatewayResult,
    metrics::TrafficMetrics,
    store::SharedStore,
};

/// Which quota an endpoint is billed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Public,
    Authenticated,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Authenticated => "authenticated",
        }
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RouteClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "authenticated" | "auth" => Ok(Self::Authenticated),
            _ => Err(format!("unsupported route class: {s}")),
        }
    }
}

/// Fixed-window quota: `limit` requests per `window_seconds`, plus `burst`
/// extra admissions once per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub limit: u64,
    pub window_seconds: u64,
    pub burst: u64,
}

impl QuotaPolicy {
    pub const fn public_default() -> Self {
        Self {
            limit: 100,
            window_seconds: 60,
            burst: 1,
        }
    }

    pub const fn authenticated_default() -> Self {
        Self {
            limit: 1_000,
            window_seconds: 60,
            burst: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_secs: Option<u64>,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    public: QuotaPolicy,
    authenticated: QuotaPolicy,
    metrics: Arc<TrafficMetrics>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn SharedStore>,
        public: QuotaPolicy,
        authenticated: QuotaPolicy,
        metrics: Arc<TrafficMetrics>,
    ) -> Self {
        Self {
            store,
            public,
            authenticated,
            metrics,
        }
    }

    pub fn policy(&self, class: RouteClass) -> QuotaPolicy {
        match class {
            RouteClass::Public => self.public,
            RouteClass::Authenticated => self.authenticated,
        }
    }

    /// Counts one request against `client_key`'s quota for `class`.
    ///
    /// Both the window counter and the burst counter are bumped with a single
    /// atomic store increment each, so concurrent requests from one client can
    /// never be admitted past `limit + burst` within a window.
    pub async fn admit(
        &self,
        client_key: &str,
        class: RouteClass,
    ) -> GatewayResult<RateLimitDecision> {
        let policy = self.policy(class);
        let window_ms = policy.window_seconds.max(1) * 1_000;
        let now_ms = self.store.now_millis().await?;
        let window_start = now_ms / window_ms * window_ms;
        // Keep the counter a little past the window end so stragglers never
        // recreate it with a fresh TTL inside the same window.
        let ttl = Duration::from_millis(window_ms + 1_000);

        let base = format!("ratelimit:{class}:{client_key}:{window_start}");
        let count = self.store.increment(&format!("{base}:count"), ttl).await?;
        if count <= policy.limit {
            return Ok(RateLimitDecision {
                allowed: true,
                remaining: policy.limit - count,
                retry_after_secs: None,
            });
        }

        if policy.burst > 0 {
            let burst_used = self.store.increment(&format!("{base}:burst"), ttl).await?;
            if burst_used <= policy.burst {
                tracing::debug!(
                    client_key,
                    route_class = %class,
                    burst_used,
                    "admitted on burst allowance"
                );
                return Ok(RateLimitDecision {
                    allowed: true,
                    remaining: 0,
                    retry_after_secs: None,
                });
            }
        }

        let window_end = window_start + window_ms;
        let retry_after_secs = window_end.saturating_sub(now_ms).div_ceil(1_000).max(1);
        self.metrics.rate_limited();
        tracing::warn!(
            client_key,
            route_class = %class,
            limit = policy.limit,
            burst = policy.burst,
            retry_after_secs,
            "rate limit exceeded"
        );

        Ok(RateLimitDecision {
            allowed: false,
            remaining: 0,
            retry_after_secs: Some(retry_after_secs),
        })
    }
}
