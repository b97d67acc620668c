pub mod idempotency;
pub mod keys;

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};

use dashmap::DashMap;
use futures::{
    FutureExt,
    future::{
        BoxFuture,
        Shared,
        WeakShared,
    },
};

use crate::{
    clock::Clock,
    config::CacheConfig,
    downstream::DownstreamResponse,
    error::{GatewayError, GatewayResult},
    metrics::TrafficMetrics,
    store::SharedStore,
};

type FetchFuture = BoxFuture<'static, GatewayResult<DownstreamResponse>>;

/// A fetch other callers can join. The cache only keeps a weak handle: the
/// fetch lives exactly as long as somebody is awaiting it.
struct InFlight {
    id: u64,
    handle: WeakShared<FetchFuture>,
}

struct CacheEntry {
    value: Option<DownstreamResponse>,
    stored_at: u64,
    ttl: Duration,
    in_flight: Option<InFlight>,
}

impl CacheEntry {
    fn empty() -> Self {
        Self {
            value: None,
            stored_at: 0,
            ttl: Duration::ZERO,
            in_flight: None,
        }
    }

    fn fresh(&self, now: u64) -> Option<&DownstreamResponse> {
        let ttl_ms = u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX);
        self.value
            .as_ref()
            .filter(|_| now.saturating_sub(self.stored_at) < ttl_ms)
    }

    fn join(&self) -> Option<Shared<FetchFuture>> {
        self.in_flight.as_ref().and_then(|f| f.handle.upgrade())
    }
}

/// How a read was served, recorded on the request for the access log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Coalesced,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Coalesced => "coalesced",
            Self::Miss => "miss",
        }
    }
}

enum Lookup {
    Hit(DownstreamResponse),
    Joined(Shared<FetchFuture>),
    Started(Shared<FetchFuture>),
}

/// Response cache with request coalescing for reads, plus the idempotency
/// record store for mutations (see [`idempotency`]).
pub struct DedupCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    next_fetch_id: AtomicU64,
    clock: Arc<dyn Clock>,
    fetch_timeout: Duration,
    store: Arc<dyn SharedStore>,
    idempotency_retention: Duration,
    metrics: Arc<TrafficMetrics>,
}

impl DedupCache {
    pub fn new(
        cfg: &CacheConfig,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<TrafficMetrics>,
    ) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_fetch_id: AtomicU64::new(1),
            clock,
            fetch_timeout: Duration::from_millis(cfg.fetch_timeout_ms),
            store,
            idempotency_retention: Duration::from_secs(cfg.idempotency_retention_seconds),
            metrics,
        }
    }

    /// Returns a fresh cached value, joins the fetch already in flight for
    /// `key`, or starts `fetch`. Concurrent callers for one key share a single
    /// `fetch` invocation and all observe the same result or error.
    ///
    /// The shared fetch keeps running if the caller that started it goes away,
    /// and is dropped once every awaiter has gone or the hard fetch timeout
    /// elapses. Failures are never cached.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> GatewayResult<(DownstreamResponse, CacheStatus)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<DownstreamResponse>> + Send + 'static,
    {
        let now = self.clock.now_millis();
        let lookup = {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(CacheEntry::empty);

            if let Some(value) = entry.fresh(now) {
                Lookup::Hit(value.clone())
            } else if let Some(shared) = entry.join() {
                Lookup::Joined(shared)
            } else {
                let id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                let shared = self.start_fetch(key, id, ttl, fetch());
                entry.in_flight = shared.downgrade().map(|handle| InFlight { id, handle });
                Lookup::Started(shared)
            }
        };

        match lookup {
            Lookup::Hit(value) => {
                self.metrics.cache_hit();
                tracing::debug!(key, "cache hit");
                Ok((value, CacheStatus::Hit))
            }
            Lookup::Joined(shared) => {
                self.metrics.dedup_coalesced();
                tracing::debug!(key, "joined in-flight fetch");
                shared.await.map(|value| (value, CacheStatus::Coalesced))
            }
            Lookup::Started(shared) => {
                self.metrics.cache_miss();
                shared.await.map(|value| (value, CacheStatus::Miss))
            }
        }
    }

    fn start_fetch<Fut>(&self, key: &str, id: u64, ttl: Duration, fetch: Fut) -> Shared<FetchFuture>
    where
        Fut: Future<Output = GatewayResult<DownstreamResponse>> + Send + 'static,
    {
        let entries = self.entries.clone();
        let clock = self.clock.clone();
        let hard_timeout = self.fetch_timeout;
        let key = key.to_string();

        async move {
            let result = match tokio::time::timeout(hard_timeout, fetch).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(key = %key, "shared fetch hit the hard timeout");
                    Err(GatewayError::Timeout {
                        service: key.split(':').next().unwrap_or_default().to_string(),
                    })
                }
            };

            // Only the registered fetch writes back; one detached by
            // `invalidate` must not repopulate the cache with older data.
            if let Some(mut entry) = entries.get_mut(&key)
                && entry.in_flight.as_ref().is_some_and(|f| f.id == id)
            {
                entry.in_flight = None;
                if let Ok(response) = &result {
                    entry.value = Some(response.clone());
                    entry.stored_at = clock.now_millis();
                    entry.ttl = ttl;
                }
            }

            result
        }
        .boxed()
        .shared()
    }

    /// Drops every entry whose key starts with `prefix`, including the
    /// registration of any fetch still in flight under it.
    pub fn invalidate(&self, prefix: &str) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let keep = !key.starts_with(prefix);
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            tracing::debug!(prefix, removed, "invalidated cached reads");
        }
        removed
    }

    /// Removes entries that are neither fresh nor backing a live fetch, and
    /// lets the shared store reclaim its expired keys.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.fresh(now).is_some() || entry.join().is_some());
        self.store.purge_expired();
        before.saturating_sub(self.entries.len())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
