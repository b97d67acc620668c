use std::{
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use axum::{
    body::{
        Body,
        to_bytes,
    },
    http::{
        HeaderName,
        HeaderValue,
        Request,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use futures::{
    FutureExt,
    future::BoxFuture,
};
use uuid::Uuid;

use crate::{
    cache::{
        CacheStatus,
        DedupCache,
        keys,
    },
    circuit_breaker::CircuitBreaker,
    clock::{
        Clock,
        SystemClock,
    },
    config::{
        GatewayConfig,
        RouteConfig,
        StoreConfig,
    },
    context::RequestContext,
    downstream::{
        Downstream,
        DownstreamRequest,
        DownstreamResponse,
        HttpDownstream,
        IDEMPOTENCY_KEY_HEADER,
    },
    error::{GatewayError, GatewayResult},
    metrics::TrafficMetrics,
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        access_log::AccessLogMiddleware,
        decision,
        rate_limit::RateLimitMiddleware,
    },
    ratelimit::{
        RateLimiter,
        RouteClass,
    },
    retry::RetryExecutor,
    store::{
        SharedStore,
        in_memory::InMemoryStore,
        redis_backend::RedisStore,
    },
};

/// The traffic-control pipeline, built once at startup and shared by the
/// HTTP handler.
pub struct Gateway {
    config: GatewayConfig,
    middlewares: Vec<Arc<dyn GatewayMiddleware>>,
    downstream: Arc<dyn Downstream>,
    breaker: CircuitBreaker,
    retry: RetryExecutor,
    cache: DedupCache,
    metrics: Arc<TrafficMetrics>,
}

impl Gateway {
    pub async fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
        let store: Arc<dyn SharedStore> = match &config.store {
            StoreConfig::InMemory => Arc::new(InMemoryStore::new()),
            StoreConfig::Redis { url, key_prefix } => {
                Arc::new(RedisStore::new(url.clone(), key_prefix.clone()).await?)
            }
        };
        let downstream = Arc::new(HttpDownstream::new(config.services.clone())?);

        tracing::info!(
            store = store.name(),
            services = config.services.len(),
            routes = config.routes.len(),
            "gateway components initialised"
        );

        Ok(Self::from_parts(
            config,
            store,
            downstream,
            Arc::new(SystemClock),
        ))
    }

    pub fn from_parts(
        config: GatewayConfig,
        store: Arc<dyn SharedStore>,
        downstream: Arc<dyn Downstream>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let metrics = Arc::new(TrafficMetrics::new());

        let mut middlewares: Vec<Arc<dyn GatewayMiddleware>> =
            vec![Arc::new(AccessLogMiddleware)];
        if config.rate_limit.enabled {
            let limiter = RateLimiter::new(
                store.clone(),
                config.rate_limit.public,
                config.rate_limit.authenticated,
                metrics.clone(),
            );
            middlewares.push(Arc::new(RateLimitMiddleware::new(
                limiter,
                config.rate_limit.fail_open_on_error,
            )));
        }

        let breaker = CircuitBreaker::new(config.circuit_breaker, store.clone(), metrics.clone());
        let retry = RetryExecutor::new(config.retry, metrics.clone());
        let cache = DedupCache::new(&config.cache, store, clock, metrics.clone());

        Self {
            config,
            middlewares,
            downstream,
            breaker,
            retry,
            cache,
            metrics,
        }
    }

    pub fn metrics(&self) -> &TrafficMetrics {
        &self.metrics
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.config.cache.sweep_interval_seconds)
    }

    pub fn purge_expired_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        client_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let max_capture = self.config.max_body_bytes.saturating_add(1);
        let body = match to_bytes(body, max_capture).await {
            Ok(body) if body.len() <= self.config.max_body_bytes => body,
            _ => {
                let mut response = GatewayError::PayloadTooLarge.into_response();
                self.attach_hardening_headers("unknown", &mut response);
                return response;
            }
        };

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut ctx = RequestContext::new(
            request_id,
            parts.method,
            parts.uri,
            parts.headers,
            body,
            client_ip,
        );
        ctx.identify(&self.config.client_key_header);
        ctx.route = self.config.resolve_route(ctx.uri.path()).cloned();

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(mut response)) => {
                    self.apply_response_middlewares(&executed, &ctx, &mut response)
                        .await;
                    self.attach_hardening_headers(&ctx.request_id, &mut response);
                    return response;
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        error = %err,
                        "middleware rejected request"
                    );
                    let mut response = err.into_response();
                    self.apply_response_middlewares(&executed, &ctx, &mut response)
                        .await;
                    self.attach_hardening_headers(&ctx.request_id, &mut response);
                    return response;
                }
            }
        }

        let outcome = match ctx.route.clone() {
            None => Err(GatewayError::RouteNotFound),
            Some(route) if ctx.is_read() => {
                let read = self.read(&ctx, &route).await;
                read.map(|(response, status)| {
                    ctx.metadata
                        .insert(decision::CACHE.to_string(), status.as_str().to_string());
                    (response, false)
                })
            }
            Some(route) => {
                let mutation = self.mutate(&ctx, &route).await;
                mutation.inspect(|(_, replayed)| {
                    ctx.metadata
                        .insert(decision::REPLAYED.to_string(), replayed.to_string());
                })
            }
        };

        let mut response = match outcome {
            Ok((downstream_response, replayed)) => {
                let mut response = downstream_response.into_response();
                if replayed {
                    response.headers_mut().insert(
                        HeaderName::from_static("idempotent-replayed"),
                        HeaderValue::from_static("true"),
                    );
                }
                response
            }
            Err(err) => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    client_key = %ctx.client_key,
                    error_code = err.code(),
                    error = %err,
                    "request failed"
                );
                err.into_response()
            }
        };

        self.apply_response_middlewares(&executed, &ctx, &mut response)
            .await;
        self.attach_hardening_headers(&ctx.request_id, &mut response);
        response
    }

    /// GET/HEAD: served from the dedup cache. Per-client routes never share
    /// responses between identities.
    async fn read(
        &self,
        ctx: &RequestContext,
        route: &RouteConfig,
    ) -> GatewayResult<(DownstreamResponse, CacheStatus)> {
        let scope = match route.class {
            RouteClass::Authenticated => keys::credential_scope(
                &ctx.client_key,
                &ctx.headers,
                &self.config.client_key_header,
            ),
            RouteClass::Public => String::new(),
        };
        let key = keys::dedup_key(
            &route.service,
            ctx.method.as_str(),
            ctx.uri.path(),
            ctx.uri.query(),
            &scope,
        );
        let ttl = Duration::from_secs(
            route
                .cache_ttl_seconds
                .unwrap_or(self.config.cache.default_ttl_seconds),
        );

        let request = self.downstream_request(ctx, None);
        self.cache
            .get_or_fetch(&key, ttl, || self.dispatch(route.service.clone(), request))
            .await
    }

    /// Mutations: run once per idempotency key, then drop the cached reads
    /// they may have made stale. Returns whether the response was replayed.
    async fn mutate(
        &self,
        ctx: &RequestContext,
        route: &RouteConfig,
    ) -> GatewayResult<(DownstreamResponse, bool)> {
        let supplied_key = ctx
            .headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string);

        let outcome = match supplied_key {
            Some(idempotency_key) => {
                let request_hash = keys::request_hash(
                    ctx.method.as_str(),
                    ctx.uri.path(),
                    ctx.uri.query(),
                    &ctx.body,
                );
                let request = self.downstream_request(ctx, Some(idempotency_key.clone()));
                let scoped_key = format!("{}:{idempotency_key}", ctx.client_key);
                self.cache
                    .with_idempotency(&route.service, &scoped_key, &request_hash, || {
                        self.dispatch(route.service.clone(), request)
                    })
                    .await
                    .map(|done| (done.response, done.replayed))
            }
            None => {
                // Retries of an unkeyed mutation still have to be recognisable
                // downstream as the same operation.
                let request = self.downstream_request(ctx, Some(Uuid::new_v4().to_string()));
                self.dispatch(route.service.clone(), request)
                    .await
                    .map(|response| (response, false))
            }
        };

        let performed = !matches!(
            outcome,
            Ok((_, true))
                | Err(GatewayError::IdempotencyConflict { .. })
                | Err(GatewayError::IdempotencyInProgress { .. })
        );
        if performed {
            self.invalidate_after_mutation(&route.service);
        }

        outcome
    }

    fn invalidate_after_mutation(&self, service: &str) {
        let dependents = self
            .config
            .invalidations
            .get(service)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let removed: usize = std::iter::once(service)
            .chain(dependents.iter().map(String::as_str))
            .map(|name| self.cache.invalidate(&keys::service_prefix(name)))
            .sum();

        tracing::debug!(service, removed, "invalidated reads after mutation");
    }

    /// One downstream operation: retries wrap the breaker, which wraps a
    /// single attempt. The future owns everything it needs so the dedup cache
    /// can share it between callers.
    fn dispatch(
        &self,
        service: String,
        request: DownstreamRequest,
    ) -> BoxFuture<'static, GatewayResult<DownstreamResponse>> {
        let retry = self.retry.clone();
        let breaker = self.breaker.clone();
        let downstream = self.downstream.clone();

        async move {
            retry
                .run(&service, |attempt| {
                    tracing::debug!(
                        service = %service,
                        request_id = %request.request_id,
                        attempt,
                        "calling downstream"
                    );
                    breaker.execute(&service, || downstream.invoke(&service, &request))
                })
                .await
        }
        .boxed()
    }

    fn downstream_request(
        &self,
        ctx: &RequestContext,
        idempotency_key: Option<String>,
    ) -> DownstreamRequest {
        let path_and_query = ctx
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| ctx.uri.path().to_string());

        DownstreamRequest {
            request_id: ctx.request_id.clone(),
            method: ctx.method.clone(),
            path_and_query,
            headers: ctx.headers.clone(),
            body: ctx.body.clone(),
            client_ip: ctx.client_ip,
            idempotency_key,
        }
    }

    async fn apply_response_middlewares(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(ctx, response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = middleware.name(),
                    error = %err,
                    "middleware post-response hook failed"
                );
            }
        }
    }

    fn attach_hardening_headers(&self, request_id: &str, response: &mut Response<Body>) {
        if let Ok(value) = HeaderValue::from_str(request_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static("x-request-id"), value);
        }

        response.headers_mut().insert(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        );
        response.headers_mut().insert(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        );
        response.headers_mut().insert(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        Arc,
        Mutex,
    };

    use async_trait::async_trait;
    use axum::{
        body::to_bytes,
        http::{
            HeaderMap,
            Method,
            StatusCode,
            header,
        },
    };
    use bytes::Bytes;

    use super::*;
    use crate::{
        clock::ManualClock,
        config::tests::sample_config,
        ratelimit::QuotaPolicy,
    };

    type Responder = dyn Fn(&str, &DownstreamRequest) -> GatewayResult<DownstreamResponse> + Send + Sync;

    /// Records every attempt and answers after a fixed latency.
    pub(crate) struct MockDownstream {
        latency: Duration,
        calls: Mutex<Vec<(String, Method, Option<String>)>>,
        responder: Box<Responder>,
    }

    impl MockDownstream {
        pub(crate) fn new(
            latency: Duration,
            responder: impl Fn(&str, &DownstreamRequest) -> GatewayResult<DownstreamResponse>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            Self {
                latency,
                calls: Mutex::new(Vec::new()),
                responder: Box::new(responder),
            }
        }

        pub(crate) fn echo(latency: Duration) -> Self {
            Self::new(latency, |service, request| {
                let status = if request.method == Method::POST {
                    StatusCode::CREATED
                } else {
                    StatusCode::OK
                };
                Ok(json_response(
                    status,
                    format!(r#"{{"service":"{service}","path":"{}"}}"#, request.path_and_query),
                ))
            })
        }

        fn calls_to(&self, service: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(s, _, _)| s == service)
                .count()
        }
    }

    #[async_trait]
    impl Downstream for MockDownstream {
        async fn invoke(
            &self,
            service: &str,
            request: &DownstreamRequest,
        ) -> GatewayResult<DownstreamResponse> {
            self.calls.lock().unwrap().push((
                service.to_string(),
                request.method.clone(),
                request.idempotency_key.clone(),
            ));
            tokio::time::sleep(self.latency).await;
            (self.responder)(service, request)
        }
    }

    pub(crate) fn json_response(status: StatusCode, body: String) -> DownstreamResponse {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        DownstreamResponse {
            status,
            headers,
            body: Bytes::from(body),
        }
    }

    pub(crate) fn gateway_with(
        config: GatewayConfig,
        downstream: Arc<MockDownstream>,
    ) -> (Gateway, ManualClock) {
        let clock = ManualClock::new(1_700_000_040_000);
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let gateway = Gateway::from_parts(config, store, downstream, Arc::new(clock.clone()));
        (gateway, clock)
    }

    fn request(method: Method, uri: &str, client: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-api-key", client)
            .body(Body::empty())
            .unwrap()
    }

    fn keyed_post(uri: &str, client: &str, key: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("x-api-key", client)
            .header(IDEMPOTENCY_KEY_HEADER, key)
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn near_simultaneous_reads_hit_downstream_once() {
        let downstream = Arc::new(MockDownstream::echo(Duration::from_millis(50)));
        let (gateway, _) = gateway_with(sample_config(), downstream.clone());

        let first = gateway.handle_http(request(Method::GET, "/transactions?accountId=1", "alice"), None);
        let second = async {
            tokio::time::sleep(Duration::from_millis(1)).await;
            gateway
                .handle_http(request(Method::GET, "/transactions?accountId=1", "alice"), None)
                .await
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(downstream.calls_to("transactions"), 1);
        assert_eq!(body_string(first).await, body_string(second).await);
    }

    #[tokio::test(start_paused = true)]
    async fn authenticated_reads_are_not_shared_between_clients() {
        let downstream = Arc::new(MockDownstream::echo(Duration::from_millis(5)));
        let (gateway, _) = gateway_with(sample_config(), downstream.clone());

        gateway.handle_http(request(Method::GET, "/accounts", "alice"), None).await;
        gateway.handle_http(request(Method::GET, "/accounts", "bob"), None).await;
        gateway.handle_http(request(Method::GET, "/accounts", "alice"), None).await;

        assert_eq!(downstream.calls_to("accounts"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bearer_tokens_behind_one_address_get_their_own_reads() {
        let downstream = Arc::new(MockDownstream::new(
            Duration::from_millis(5),
            |_: &str, request: &DownstreamRequest| {
                let owner = request
                    .headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                Ok(json_response(StatusCode::OK, format!(r#"{{"owner":"{owner}"}}"#)))
            },
        ));
        let (gateway, _) = gateway_with(sample_config(), downstream.clone());
        let office: IpAddr = "10.0.0.5".parse().unwrap();
        let bearer = |token: &str| {
            Request::builder()
                .uri("/accounts")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap()
        };

        let alice = gateway.handle_http(bearer("alice"), Some(office)).await;
        let bob = gateway.handle_http(bearer("bob"), Some(office)).await;

        assert_eq!(body_string(alice).await, r#"{"owner":"Bearer alice"}"#);
        assert_eq!(body_string(bob).await, r#"{"owner":"Bearer bob"}"#);
        assert_eq!(downstream.calls_to("accounts"), 2);

        let alice_again = gateway.handle_http(bearer("alice"), Some(office)).await;
        assert_eq!(body_string(alice_again).await, r#"{"owner":"Bearer alice"}"#);
        assert_eq!(downstream.calls_to("accounts"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keyed_mutation_replays_and_invalidates_dependent_reads() {
        let downstream = Arc::new(MockDownstream::echo(Duration::from_millis(5)));
        let (gateway, _) = gateway_with(sample_config(), downstream.clone());

        gateway.handle_http(request(Method::GET, "/accounts/1", "alice"), None).await;
        gateway.handle_http(request(Method::GET, "/accounts/1", "alice"), None).await;
        assert_eq!(downstream.calls_to("accounts"), 1);

        let posted = gateway
            .handle_http(keyed_post("/transactions", "alice", "K1", r#"{"amount":5}"#), None)
            .await;
        assert_eq!(posted.status(), StatusCode::CREATED);
        assert!(posted.headers().get("idempotent-replayed").is_none());

        let replayed = gateway
            .handle_http(keyed_post("/transactions", "alice", "K1", r#"{"amount":5}"#), None)
            .await;
        assert_eq!(replayed.status(), StatusCode::CREATED);
        assert_eq!(replayed.headers().get("idempotent-replayed").unwrap(), "true");
        assert_eq!(downstream.calls_to("transactions"), 1);

        gateway.handle_http(request(Method::GET, "/accounts/1", "alice"), None).await;
        assert_eq!(downstream.calls_to("accounts"), 2);

        let calls = downstream.calls.lock().unwrap();
        let (_, _, key) = calls.iter().find(|(s, _, _)| s == "transactions").unwrap();
        assert_eq!(key.as_deref(), Some("K1"));
    }

    #[tokio::test(start_paused = true)]
    async fn reused_key_with_new_body_is_a_conflict() {
        let downstream = Arc::new(MockDownstream::echo(Duration::from_millis(5)));
        let (gateway, _) = gateway_with(sample_config(), downstream.clone());

        gateway
            .handle_http(keyed_post("/budgets", "alice", "K2", r#"{"limit":100}"#), None)
            .await;
        let conflict = gateway
            .handle_http(keyed_post("/budgets", "alice", "K2", r#"{"limit":200}"#), None)
            .await;

        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        assert!(body_string(conflict).await.contains("idempotency_conflict"));
        assert_eq!(downstream.calls_to("budgets"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn public_quota_rejects_with_retry_after() {
        let mut config = sample_config();
        config.rate_limit.public = QuotaPolicy {
            limit: 2,
            window_seconds: 60,
            burst: 0,
        };
        let downstream = Arc::new(MockDownstream::echo(Duration::ZERO));
        let (gateway, _) = gateway_with(config, downstream.clone());

        let first = gateway.handle_http(request(Method::GET, "/auth/status", "c"), None).await;
        assert_eq!(first.headers().get("x-ratelimit-remaining").unwrap(), "1");
        gateway.handle_http(request(Method::GET, "/auth/status", "c"), None).await;

        let limited = gateway.handle_http(request(Method::GET, "/auth/status", "c"), None).await;
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.headers().get(header::RETRY_AFTER).unwrap(), "60");
        assert!(limited.headers().contains_key("x-request-id"));
        assert!(
            gateway
                .metrics()
                .render_prometheus()
                .contains("gateway_rate_limited_total 1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failing_service_trips_breaker_then_probes_after_cooldown() {
        let mut config = sample_config();
        config.retry.max_attempts = 1;
        let downstream = Arc::new(MockDownstream::new(Duration::from_millis(5), |service, _| {
            Err(GatewayError::Timeout {
                service: service.to_string(),
            })
        }));
        let (gateway, clock) = gateway_with(config, downstream.clone());

        for _ in 0..5 {
            let response = gateway
                .handle_http(request(Method::POST, "/accounts", "alice"), None)
                .await;
            assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        }

        let rejected = gateway
            .handle_http(request(Method::POST, "/accounts", "alice"), None)
            .await;
        assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(body_string(rejected).await.contains("circuit_open"));
        assert_eq!(downstream.calls_to("accounts"), 5);

        clock.advance(30_000);
        gateway
            .handle_http(request(Method::POST, "/accounts", "alice"), None)
            .await;
        assert_eq!(downstream.calls_to("accounts"), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_with_the_same_key() {
        let attempts = Arc::new(Mutex::new(0u32));
        let downstream = Arc::new(MockDownstream::new(Duration::from_millis(5), {
            let attempts = attempts.clone();
            move |service: &str, _: &DownstreamRequest| {
                let mut attempts = attempts.lock().unwrap();
                *attempts += 1;
                if *attempts < 3 {
                    Err(GatewayError::Network {
                        service: service.to_string(),
                        message: "connection reset".to_string(),
                    })
                } else {
                    Ok(json_response(StatusCode::CREATED, "{}".to_string()))
                }
            }
        }));
        let (gateway, _) = gateway_with(sample_config(), downstream.clone());

        let response = gateway
            .handle_http(request(Method::POST, "/transactions", "alice"), None)
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let calls = downstream.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].2.is_some());
        assert!(calls.iter().all(|(_, _, key)| key == &calls[0].2));
    }

    #[tokio::test]
    async fn unknown_route_is_404_with_hardening_headers() {
        let downstream = Arc::new(MockDownstream::echo(Duration::ZERO));
        let (gateway, _) = gateway_with(sample_config(), downstream);

        let response = gateway
            .handle_http(
                Request::builder()
                    .uri("/ledger")
                    .header("x-request-id", "req-77")
                    .body(Body::empty())
                    .unwrap(),
                None,
            )
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("x-request-id").unwrap(), "req-77");
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(response.headers().get("x-content-type-options").unwrap(), "nosniff");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let mut config = sample_config();
        config.max_body_bytes = 4;
        let downstream = Arc::new(MockDownstream::echo(Duration::ZERO));
        let (gateway, _) = gateway_with(config, downstream.clone());

        let response = gateway
            .handle_http(keyed_post("/transactions", "alice", "K9", "too large"), None)
            .await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(downstream.calls_to("transactions"), 0);
    }
}
