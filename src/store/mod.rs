pub mod in_memory;
pub mod redis_backend;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::GatewayResult;

/// Atomic key-value operations shared by every gateway instance.
///
/// Rate-limit windows, breaker state and idempotency records are only ever
/// mutated through these primitives, so swapping the in-memory map for Redis
/// changes nothing above this trait.
#[async_trait]
pub trait SharedStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// The store's own clock. Used instead of instance wall time so that
    /// instances sharing counters agree on window boundaries.
    async fn now_millis(&self) -> GatewayResult<u64>;

    /// Increments the counter at `key` and returns the new value. A missing or
    /// expired key starts at zero and lives for `ttl` from its creation.
    async fn increment(&self, key: &str, ttl: Duration) -> GatewayResult<u64>;

    /// Replaces the value at `key` with `new` only if the current value equals
    /// `expected` (`None` meaning absent or expired).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> GatewayResult<bool>;

    async fn get(&self, key: &str) -> GatewayResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> GatewayResult<()>;

    async fn delete(&self, key: &str) -> GatewayResult<()>;

    /// Reclaims memory held by expired keys. Backends with native expiry
    /// have nothing to do.
    fn purge_expired(&self) {}
}
