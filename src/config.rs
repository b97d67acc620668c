use anyhow::{Context, Result, anyhow};
use std::{
    collections::{HashMap, HashSet},
    env,
    net::SocketAddr,
};

use crate::{
    ratelimit::{QuotaPolicy, RouteClass},
    retry::RetryPolicy,
};

const DEFAULT_SERVICES: &str = "auth=http://127.0.0.1:9001,\
    accounts=http://127.0.0.1:9002,\
    transactions=http://127.0.0.1:9003,\
    budgets=http://127.0.0.1:9004,\
    investments=http://127.0.0.1:9005";

const DEFAULT_ROUTES: &str = "/auth=auth@public,\
    /accounts=accounts@authenticated,\
    /transactions=transactions@authenticated,\
    /budgets=budgets@authenticated,\
    /investments=investments@authenticated";

const DEFAULT_INVALIDATIONS: &str = "transactions=accounts|budgets";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub log_format: LogFormat,
    pub max_body_bytes: usize,
    pub client_key_header: String,
    pub store: StoreConfig,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub services: Vec<ServiceConfig>,
    pub routes: Vec<RouteConfig>,
    /// Services whose cached reads a mutation on the keyed service makes stale.
    pub invalidations: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    InMemory,
    Redis { url: String, key_prefix: String },
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub fail_open_on_error: bool,
    pub public: QuotaPolicy,
    pub authenticated: QuotaPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub default_ttl_seconds: u64,
    pub fetch_timeout_ms: u64,
    pub sweep_interval_seconds: u64,
    pub idempotency_retention_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 30,
            fetch_timeout_ms: 10_000,
            sweep_interval_seconds: 60,
            idempotency_retention_seconds: 86_400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
    pub base_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub service: String,
    pub class: RouteClass,
    /// Cache TTL for reads on this route; `None` uses the cache default.
    pub cache_ttl_seconds: Option<u64>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "compact".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "compact" | "text" => LogFormat::Compact,
            "json" => LogFormat::Json,
            other => return Err(anyhow!("unsupported LOG_FORMAT: {other}")),
        };

        let store = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => StoreConfig::InMemory,
            "redis" => {
                let url = env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
                let key_prefix =
                    env::var("REDIS_KEY_PREFIX").unwrap_or_else(|_| "gateway".to_string());
                StoreConfig::Redis { url, key_prefix }
            }
            other => return Err(anyhow!("unsupported STORE_BACKEND: {other}")),
        };

        let public_default = QuotaPolicy::public_default();
        let authenticated_default = QuotaPolicy::authenticated_default();
        let rate_limit = RateLimitConfig {
            enabled: parse_env("RATE_LIMIT_ENABLED", true),
            fail_open_on_error: parse_env("RATE_LIMIT_FAIL_OPEN", false),
            public: QuotaPolicy {
                limit: parse_env("RATE_LIMIT_PUBLIC_LIMIT", public_default.limit),
                window_seconds: parse_env(
                    "RATE_LIMIT_PUBLIC_WINDOW_SECONDS",
                    public_default.window_seconds,
                )
                .max(1),
                burst: parse_env("RATE_LIMIT_PUBLIC_BURST", public_default.burst),
            },
            authenticated: QuotaPolicy {
                limit: parse_env("RATE_LIMIT_AUTHENTICATED_LIMIT", authenticated_default.limit),
                window_seconds: parse_env(
                    "RATE_LIMIT_AUTHENTICATED_WINDOW_SECONDS",
                    authenticated_default.window_seconds,
                )
                .max(1),
                burst: parse_env("RATE_LIMIT_AUTHENTICATED_BURST", authenticated_default.burst),
            },
        };

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: parse_env("CB_FAILURE_THRESHOLD", 5u32).max(1),
            cooldown_seconds: parse_env("CB_COOLDOWN_SECONDS", 30u64),
        };

        let retry_default = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_env("RETRY_MAX_ATTEMPTS", retry_default.max_attempts).max(1),
            base_delay_ms: parse_env("RETRY_BASE_DELAY_MS", retry_default.base_delay_ms),
            max_delay_ms: parse_env("RETRY_MAX_DELAY_MS", retry_default.max_delay_ms),
            jitter: parse_env("RETRY_JITTER", retry_default.jitter),
        };

        let cache_default = CacheConfig::default();
        let cache = CacheConfig {
            default_ttl_seconds: parse_env(
                "CACHE_DEFAULT_TTL_SECONDS",
                cache_default.default_ttl_seconds,
            ),
            fetch_timeout_ms: parse_env("CACHE_FETCH_TIMEOUT_MS", cache_default.fetch_timeout_ms)
                .max(1),
            sweep_interval_seconds: parse_env(
                "CACHE_SWEEP_SECONDS",
                cache_default.sweep_interval_seconds,
            )
            .max(1),
            idempotency_retention_seconds: parse_env(
                "IDEMPOTENCY_RETENTION_SECONDS",
                cache_default.idempotency_retention_seconds,
            )
            .max(1),
        };

        let services = parse_services(
            &env::var("SERVICES").unwrap_or_else(|_| DEFAULT_SERVICES.to_string()),
        )?;
        let routes =
            parse_routes(&env::var("ROUTES").unwrap_or_else(|_| DEFAULT_ROUTES.to_string()))?;
        let invalidations = parse_invalidations(
            &env::var("INVALIDATIONS").unwrap_or_else(|_| DEFAULT_INVALIDATIONS.to_string()),
        )?;

        let config = Self {
            bind_addr,
            log_format,
            max_body_bytes: parse_env("MAX_BODY_BYTES", 1_048_576usize),
            client_key_header: env::var("CLIENT_KEY_HEADER")
                .unwrap_or_else(|_| "x-api-key".to_string())
                .to_ascii_lowercase(),
            store,
            rate_limit,
            circuit_breaker,
            retry,
            cache,
            services,
            routes,
            invalidations,
        };
        config.validate()?;
        Ok(config)
    }

    /// Quotas must admit something, and every route and invalidation must name
    /// a configured service.
    pub fn validate(&self) -> Result<()> {
        for (class, policy) in [
            (RouteClass::Public, &self.rate_limit.public),
            (RouteClass::Authenticated, &self.rate_limit.authenticated),
        ] {
            if policy.limit == 0 || policy.window_seconds == 0 {
                return Err(anyhow!(
                    "{class} quota needs a positive limit and window"
                ));
            }
        }

        let known: HashSet<&str> = self.services.iter().map(|s| s.name.as_str()).collect();

        for route in &self.routes {
            if !known.contains(route.service.as_str()) {
                return Err(anyhow!(
                    "route {} references unknown service {}",
                    route.path_prefix,
                    route.service
                ));
            }
        }

        for (service, dependents) in &self.invalidations {
            if let Some(unknown) = std::iter::once(service)
                .chain(dependents)
                .find(|name| !known.contains(name.as_str()))
            {
                return Err(anyhow!("invalidation references unknown service {unknown}"));
            }
        }
        Ok(())
    }

    /// Longest configured prefix matching `path` on a segment boundary.
    pub fn resolve_route(&self, path: &str) -> Option<&RouteConfig> {
        self.routes
            .iter()
            .filter(|route| prefix_matches(&route.path_prefix, path))
            .max_by_key(|route| route.path_prefix.len())
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    let prefix = prefix.trim_end_matches('/');
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn parse_services(raw: &str) -> Result<Vec<ServiceConfig>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (name, rhs) = split_entry(chunk, "service")?;

        let mut spec = rhs.splitn(2, '@');
        let base_url = spec
            .next()
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("invalid service URL for {name}"))?;
        let timeout_ms = spec
            .next()
            .map(|s| s.trim().parse::<u64>().context("invalid service timeout"))
            .transpose()?
            .unwrap_or(3_000)
            .max(100);

        out.push(ServiceConfig {
            name,
            base_url,
            timeout_ms,
        });
    }

    if out.is_empty() {
        return Err(anyhow!("no services configured"));
    }
    Ok(out)
}

fn parse_routes(raw: &str) -> Result<Vec<RouteConfig>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (path_prefix, rhs) = split_entry(chunk, "route")?;
        if !path_prefix.starts_with('/') {
            return Err(anyhow!("route prefix must start with '/': {chunk}"));
        }

        let spec: Vec<&str> = rhs.split('@').map(str::trim).collect();
        let service = spec
            .first()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("route has no service: {chunk}"))?
            .to_string();
        let class = spec
            .get(1)
            .map(|s| s.parse::<RouteClass>().map_err(|e| anyhow!(e)))
            .transpose()?
            .unwrap_or(RouteClass::Authenticated);
        let cache_ttl_seconds = spec
            .get(2)
            .map(|s| s.parse::<u64>().context("invalid route cache ttl"))
            .transpose()?;

        out.push(RouteConfig {
            path_prefix,
            service,
            class,
            cache_ttl_seconds,
        });
    }

    if out.is_empty() {
        return Err(anyhow!("no routes configured"));
    }
    Ok(out)
}

fn parse_invalidations(raw: &str) -> Result<HashMap<String, Vec<String>>> {
    let mut out = HashMap::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let (service, rhs) = split_entry(chunk, "invalidation")?;
        let dependents = rhs
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        out.insert(service, dependents);
    }
    Ok(out)
}

fn split_entry<'a>(chunk: &'a str, what: &str) -> Result<(String, &'a str)> {
    let mut parts = chunk.splitn(2, '=');
    let name = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("invalid {what} entry: {chunk}"))?
        .to_string();
    let rhs = parts
        .next()
        .map(str::trim)
        .ok_or_else(|| anyhow!("invalid {what} entry: {chunk}"))?;
    Ok((name, rhs))
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
