use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};

use crate::{
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware, decision},
    ratelimit::RateLimiter,
};

pub struct RateLimitMiddleware {
    limiter: RateLimiter,
    fail_open_on_error: bool,
}

impl RateLimitMiddleware {
    pub fn new(limiter: RateLimiter, fail_open_on_error: bool) -> Self {
        Self {
            limiter,
            fail_open_on_error,
        }
    }
}

#[async_trait]
impl GatewayMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        let class = ctx.route_class();

        match self.limiter.admit(&ctx.client_key, class).await {
            Ok(admission) => {
                ctx.metadata.insert(
                    decision::RATE_LIMIT_REMAINING.to_string(),
                    admission.remaining.to_string(),
                );
                let verdict = if admission.allowed { "admitted" } else { "rejected" };
                ctx.metadata
                    .insert(decision::RATE_LIMIT.to_string(), verdict.to_string());

                match admission.retry_after_secs {
                    Some(retry_after_secs) if !admission.allowed => {
                        Ok(ControlFlow::ShortCircuit(
                            GatewayError::RateLimited { retry_after_secs }.into_response(),
                        ))
                    }
                    _ => Ok(ControlFlow::Continue),
                }
            }
            Err(err) => {
                if self.fail_open_on_error {
                    ctx.metadata
                        .insert(decision::RATE_LIMIT.to_string(), "fail_open".to_string());
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        error = %err,
                        "rate limiter store failed; allowing request because fail-open is enabled"
                    );
                    Ok(ControlFlow::Continue)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        if let Some(remaining) = ctx.metadata.get(decision::RATE_LIMIT_REMAINING)
            && let Ok(value) = HeaderValue::from_str(remaining)
        {
            response
                .headers_mut()
                .insert(HeaderName::from_static("x-ratelimit-remaining"), value);
        }

        Ok(())
    }
}
