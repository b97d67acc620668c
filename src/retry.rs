use std::{
    future::Future,
    sync::Arc,
    time::Duration,
};

use rand::Rng;

use crate::{
    error::{GatewayError, GatewayResult},
    metrics::TrafficMetrics,
};

/// Largest fraction by which a jittered delay may deviate from the nominal one.
const JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Nominal delay before attempt `attempt` (1-based): nothing before the
    /// first, then `base * 2^(attempt - 2)` capped at `max_delay_ms`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempt - 2);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if !self.jitter || nominal.is_zero() {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
        nominal.mul_f64(1.0 + spread)
    }
}

/// Issues an operation with bounded retries on transient failures.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    metrics: Arc<TrafficMetrics>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, metrics: Arc<TrafficMetrics>) -> Self {
        Self { policy, metrics }
    }

    /// Calls `attempt_fn` with the 1-based attempt number until it succeeds,
    /// fails terminally, or `max_attempts` transient failures have occurred.
    ///
    /// Callers performing mutations must send the same idempotency key on every
    /// attempt; the executor itself never alters the request.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> GatewayResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match attempt_fn(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                return Err(err);
            }

            if attempt >= max_attempts {
                self.metrics.retry_exhausted();
                tracing::warn!(
                    operation,
                    attempts = attempt,
                    error = %err,
                    "retries exhausted"
                );
                return Err(GatewayError::RetryExhausted {
                    attempts: attempt,
                    cause: Box::new(err),
                });
            }

            attempt += 1;
            let delay = self.policy.delay(attempt);
            self.metrics.retried();
            tracing::debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
