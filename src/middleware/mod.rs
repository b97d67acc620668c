pub mod access_log;
pub mod rate_limit;

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
};

/// Keys under which the pipeline records its decisions in
/// [`RequestContext::metadata`], for the response hooks to read back.
pub mod decision {
    /// `admitted`, `rejected` or `fail_open`.
    pub const RATE_LIMIT: &str = "ratelimit.decision";
    pub const RATE_LIMIT_REMAINING: &str = "ratelimit.remaining";
    /// One of [`crate::cache::CacheStatus`], set on reads that got a response.
    pub const CACHE: &str = "cache.status";
    /// `true` when a keyed mutation was answered from its stored record.
    pub const REPLAYED: &str = "idempotency.replayed";
}

/// What a request hook wants the gateway to do next. A short circuit answers
/// the client directly; hooks that already ran still see the response.
pub enum ControlFlow {
    Continue,
    ShortCircuit(Response<Body>),
}

/// A stage that runs before routing and again, in reverse order, on the way
/// out. Errors from `on_request` become the client's response.
#[async_trait]
pub trait GatewayMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow>;

    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        Ok(())
    }
}
