use async_trait::async_trait;
use axum::{
    body::Body,
    http::StatusCode,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{ControlFlow, GatewayMiddleware, decision},
};

/// One line per request on the way in, and one on the way out carrying every
/// traffic-control decision taken for it.
pub struct AccessLogMiddleware;

/// The outcome fields of a finished request, read back from its metadata.
#[derive(Debug, PartialEq, Eq)]
struct TrafficSummary<'a> {
    service: Option<&'a str>,
    rate_limit: Option<&'a str>,
    remaining: Option<&'a str>,
    cache: Option<&'a str>,
    replayed: bool,
}

impl<'a> TrafficSummary<'a> {
    fn of(ctx: &'a RequestContext) -> Self {
        let meta = |key: &str| ctx.metadata.get(key).map(String::as_str);
        Self {
            service: ctx.route.as_ref().map(|r| r.service.as_str()),
            rate_limit: meta(decision::RATE_LIMIT),
            remaining: meta(decision::RATE_LIMIT_REMAINING),
            cache: meta(decision::CACHE),
            replayed: meta(decision::REPLAYED) == Some("true"),
        }
    }
}

#[async_trait]
impl GatewayMiddleware for AccessLogMiddleware {
    fn name(&self) -> &'static str {
        "access-log"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            client_key = %ctx.client_key,
            route_class = %ctx.route_class(),
            service = ctx.route.as_ref().map(|r| r.service.as_str()),
            "request received"
        );
        Ok(ControlFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        let summary = TrafficSummary::of(ctx);
        let status = response.status();
        let latency_ms = ctx.started_at.elapsed().as_millis() as u64;

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!(
                request_id = %ctx.request_id,
                client_key = %ctx.client_key,
                status = status.as_u16(),
                service = summary.service,
                rate_limit = summary.rate_limit,
                cache = summary.cache,
                latency_ms,
                "request refused or failed"
            );
        } else {
            tracing::info!(
                request_id = %ctx.request_id,
                client_key = %ctx.client_key,
                status = status.as_u16(),
                service = summary.service,
                rate_limit = summary.rate_limit,
                quota_remaining = summary.remaining,
                cache = summary.cache,
                replayed = summary.replayed,
                latency_ms,
                "request completed"
            );
        }
        Ok(())
    }
}
