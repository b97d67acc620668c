use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for the events the traffic-control layer emits. Every increment is
/// paired with a structured `tracing` event at the call site.
#[derive(Debug, Default)]
pub struct TrafficMetrics {
    rate_limited_total: AtomicU64,
    breaker_opened_total: AtomicU64,
    circuit_rejected_total: AtomicU64,
    cache_hits_total: AtomicU64,
    cache_misses_total: AtomicU64,
    dedup_coalesced_total: AtomicU64,
    retries_total: AtomicU64,
    retry_exhausted_total: AtomicU64,
    idempotent_replays_total: AtomicU64,
    idempotency_conflicts_total: AtomicU64,
}

impl TrafficMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn breaker_opened(&self) {
        self.breaker_opened_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_rejected(&self) {
        self.circuit_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dedup_coalesced(&self) {
        self.dedup_coalesced_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retried(&self) {
        self.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_exhausted(&self) {
        self.retry_exhausted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idempotent_replay(&self) {
        self.idempotent_replays_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idempotency_conflict(&self) {
        self.idempotency_conflicts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        let counters = [
            ("gateway_rate_limited_total", &self.rate_limited_total),
            ("gateway_breaker_opened_total", &self.breaker_opened_total),
            ("gateway_circuit_rejected_total", &self.circuit_rejected_total),
            ("gateway_cache_hits_total", &self.cache_hits_total),
            ("gateway_cache_misses_total", &self.cache_misses_total),
            ("gateway_dedup_coalesced_total", &self.dedup_coalesced_total),
            ("gateway_retries_total", &self.retries_total),
            ("gateway_retry_exhausted_total", &self.retry_exhausted_total),
            ("gateway_idempotent_replays_total", &self.idempotent_replays_total),
            (
                "gateway_idempotency_conflicts_total",
                &self.idempotency_conflicts_total,
            ),
        ];

        let mut out = String::new();
        for (name, counter) in counters {
            out.push_str(&format!(
                "# TYPE {name} counter\n{name} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }
        out
    }
}
