use std::{
    future::Future,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{
    config::CircuitBreakerConfig,
    error::{GatewayError, GatewayResult},
    metrics::TrafficMetrics,
    store::SharedStore,
};

/// Upper bound on compare-and-swap retries for a single transition. Losing
/// this many races in a row means other callers are moving the state along.
const MAX_CAS_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

/// Per-service breaker document, stored as JSON under `breaker:{service}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerState {
    pub state: BreakerPhase,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<u64>,
    pub opened_at: Option<u64>,
    pub probe_started_at: Option<u64>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: BreakerPhase::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            probe_started_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Pass,
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    store: Arc<dyn SharedStore>,
    metrics: Arc<TrafficMetrics>,
}

impl CircuitBreaker {
    pub fn new(
        cfg: CircuitBreakerConfig,
        store: Arc<dyn SharedStore>,
        metrics: Arc<TrafficMetrics>,
    ) -> Self {
        Self {
            cfg,
            store,
            metrics,
        }
    }

    /// Runs `call` unless the breaker for `service` is shedding load.
    ///
    /// Fails with [`GatewayError::CircuitOpen`] without invoking `call` while
    /// the breaker is open, or while another caller holds the half-open probe.
    /// Otherwise the call's own result is returned after being recorded.
    pub async fn execute<T, F, Fut>(&self, service: &str, call: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let admission = match self.admit(service).await {
            Ok(admission) => admission,
            Err(err @ GatewayError::CircuitOpen { .. }) => {
                self.metrics.circuit_rejected();
                tracing::debug!(service, "circuit open; short-circuiting call");
                return Err(err);
            }
            Err(err) => {
                tracing::warn!(
                    service,
                    error = %err,
                    "breaker state unavailable; letting call through"
                );
                Admission::Pass
            }
        };

        let result = call().await;

        let outcome = match &result {
            Ok(_) => Some(Outcome::Success),
            Err(err) if err.is_downstream_failure() => Some(Outcome::Failure),
            // A probe has to resolve one way or the other.
            Err(_) if admission == Admission::Probe => Some(Outcome::Failure),
            Err(_) => None,
        };

        if let Some(outcome) = outcome
            && let Err(err) = self.record(service, admission, outcome).await
        {
            tracing::warn!(service, error = %err, "failed to record breaker outcome");
        }

        result
    }

    #[cfg(test)]
    pub async fn snapshot(&self, service: &str) -> GatewayResult<BreakerState> {
        let raw = self.store.get(&state_key(service)).await?;
        decode(raw.as_deref())
    }

    async fn admit(&self, service: &str) -> GatewayResult<Admission> {
        let key = state_key(service);
        let cooldown_ms = self.cfg.cooldown_seconds.saturating_mul(1_000);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.store.get(&key).await?;
            let state = decode(raw.as_deref())?;

            let now = match state.state {
                BreakerPhase::Closed => return Ok(Admission::Pass),
                BreakerPhase::Open => {
                    let now = self.store.now_millis().await?;
                    let opened_at = state.opened_at.unwrap_or(0);
                    if now.saturating_sub(opened_at) < cooldown_ms {
                        return Err(open_error(service));
                    }
                    now
                }
                BreakerPhase::HalfOpen => {
                    let now = self.store.now_millis().await?;
                    let started = state.probe_started_at.unwrap_or(0);
                    if now.saturating_sub(started) < cooldown_ms {
                        return Err(open_error(service));
                    }
                    tracing::warn!(service, "half-open probe never resolved; reclaiming it");
                    now
                }
            };

            let next = BreakerState {
                state: BreakerPhase::HalfOpen,
                probe_started_at: Some(now),
                ..state
            };
            if self.swap(&key, raw.as_deref(), &next).await? {
                tracing::info!(service, "circuit breaker half-open; sending probe");
                return Ok(Admission::Probe);
            }
        }

        Err(open_error(service))
    }

    async fn record(
        &self,
        service: &str,
        admission: Admission,
        outcome: Outcome,
    ) -> GatewayResult<()> {
        let key = state_key(service);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw = self.store.get(&key).await?;
            let state = decode(raw.as_deref())?;

            let next = match (outcome, state.state) {
                (Outcome::Success, BreakerPhase::Closed) => {
                    if state.consecutive_failures == 0 {
                        return Ok(());
                    }
                    BreakerState {
                        consecutive_failures: 0,
                        ..state.clone()
                    }
                }
                (Outcome::Success, BreakerPhase::HalfOpen) if admission == Admission::Probe => {
                    BreakerState::default()
                }
                (Outcome::Failure, BreakerPhase::Closed) => {
                    let now = self.store.now_millis().await?;
                    let failures = state.consecutive_failures.saturating_add(1);
                    if failures >= self.cfg.failure_threshold {
                        BreakerState {
                            state: BreakerPhase::Open,
                            consecutive_failures: failures,
                            last_failure_at: Some(now),
                            opened_at: Some(now),
                            probe_started_at: None,
                        }
                    } else {
                        BreakerState {
                            consecutive_failures: failures,
                            last_failure_at: Some(now),
                            ..state.clone()
                        }
                    }
                }
                (Outcome::Failure, BreakerPhase::HalfOpen) if admission == Admission::Probe => {
                    let now = self.store.now_millis().await?;
                    BreakerState {
                        state: BreakerPhase::Open,
                        consecutive_failures: state.consecutive_failures.saturating_add(1),
                        last_failure_at: Some(now),
                        opened_at: Some(now),
                        probe_started_at: None,
                    }
                }
                // Late results from calls admitted before a transition.
                _ => return Ok(()),
            };

            if self.swap(&key, raw.as_deref(), &next).await? {
                self.log_transition(service, &state, &next);
                return Ok(());
            }
        }

        Err(GatewayError::Store(format!(
            "breaker state for {service} kept changing underneath"
        )))
    }

    async fn swap(
        &self,
        key: &str,
        expected: Option<&str>,
        next: &BreakerState,
    ) -> GatewayResult<bool> {
        let encoded = serde_json::to_string(next)?;
        self.store
            .compare_and_swap(key, expected, &encoded, None)
            .await
    }

    fn log_transition(&self, service: &str, from: &BreakerState, to: &BreakerState) {
        match (from.state, to.state) {
            (prev, BreakerPhase::Open) if prev != BreakerPhase::Open => {
                self.metrics.breaker_opened();
                tracing::warn!(
                    service,
                    consecutive_failures = to.consecutive_failures,
                    cooldown_seconds = self.cfg.cooldown_seconds,
                    "circuit breaker opened"
                );
            }
            (BreakerPhase::HalfOpen, BreakerPhase::Closed) => {
                tracing::info!(service, "circuit breaker closed; probe succeeded");
            }
            _ => {}
        }
    }
}

fn state_key(service: &str) -> String {
    format!("breaker:{service}")
}

fn decode(raw: Option<&str>) -> GatewayResult<BreakerState> {
    match raw {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(BreakerState::default()),
    }
}

fn open_error(service: &str) -> GatewayError {
    GatewayError::CircuitOpen {
        service: service.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{
                AtomicUsize,
                Ordering,
            },
        },
        time::Duration,
    };

    use axum::http::{HeaderMap, StatusCode};
    use bytes::Bytes;
    use futures::future::join_all;

    use super::*;
    use crate::{
        clock::ManualClock,
        store::in_memory::InMemoryStore,
    };

    fn breaker() -> (CircuitBreaker, ManualClock, Arc<InMemoryStore>) {
        let clock = ManualClock::new(1_000_000);
        let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            store.clone(),
            Arc::new(TrafficMetrics::new()),
        );
        (breaker, clock, store)
    }

    fn timeout() -> GatewayError {
        GatewayError::Timeout {
            service: "accounts".to_string(),
        }
    }

    async fn call(
        breaker: &CircuitBreaker,
        invocations: &AtomicUsize,
        result: GatewayResult<u32>,
    ) -> GatewayResult<u32> {
        breaker
            .execute("accounts", || async {
                invocations.fetch_add(1, Ordering::SeqCst);
                result
            })
            .await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_skips_downstream() {
        let (breaker, _, _) = breaker();
        let invocations = AtomicUsize::new(0);

        for _ in 0..5 {
            let err = call(&breaker, &invocations, Err(timeout())).await.unwrap_err();
            assert!(matches!(err, GatewayError::Timeout { .. }));
        }

        let err = call(&breaker, &invocations, Ok(1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
        assert_eq!(invocations.load(Ordering::SeqCst), 5);

        let state = breaker.snapshot("accounts").await.unwrap();
        assert_eq!(state.state, BreakerPhase::Open);
        assert_eq!(state.opened_at, Some(1_000_000));
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let (breaker, _, _) = breaker();
        let invocations = AtomicUsize::new(0);

        for _ in 0..4 {
            let _ = call(&breaker, &invocations, Err(timeout())).await;
        }
        call(&breaker, &invocations, Ok(1)).await.unwrap();
        assert_eq!(
            breaker.snapshot("accounts").await.unwrap().consecutive_failures,
            0
        );

        for _ in 0..4 {
            let _ = call(&breaker, &invocations, Err(timeout())).await;
        }
        assert_eq!(
            breaker.snapshot("accounts").await.unwrap().state,
            BreakerPhase::Closed
        );
    }

    #[tokio::test]
    async fn terminal_client_error_counts_once() {
        let (breaker, _, _) = breaker();
        let invocations = AtomicUsize::new(0);
        let not_found = GatewayError::Downstream {
            service: "accounts".to_string(),
            status: StatusCode::NOT_FOUND,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };

        let _ = call(&breaker, &invocations, Err(not_found)).await;
        assert_eq!(
            breaker.snapshot("accounts").await.unwrap().consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn probe_after_cooldown_closes_on_success() {
        let (breaker, clock, _) = breaker();
        let invocations = AtomicUsize::new(0);

        for _ in 0..5 {
            let _ = call(&breaker, &invocations, Err(timeout())).await;
        }
        clock.advance(29_999);
        assert!(call(&breaker, &invocations, Ok(1)).await.is_err());
        assert_eq!(invocations.load(Ordering::SeqCst), 5);

        clock.advance(1);
        assert_eq!(call(&breaker, &invocations, Ok(7)).await.unwrap(), 7);
        assert_eq!(invocations.load(Ordering::SeqCst), 6);
        assert_eq!(
            breaker.snapshot("accounts").await.unwrap(),
            BreakerState::default()
        );
    }

    #[tokio::test]
    async fn failed_probe_reopens_with_fresh_cooldown() {
        let (breaker, clock, _) = breaker();
        let invocations = AtomicUsize::new(0);

        for _ in 0..5 {
            let _ = call(&breaker, &invocations, Err(timeout())).await;
        }
        clock.advance(30_000);
        assert!(matches!(
            call(&breaker, &invocations, Err(timeout())).await,
            Err(GatewayError::Timeout { .. })
        ));

        let state = breaker.snapshot("accounts").await.unwrap();
        assert_eq!(state.state, BreakerPhase::Open);
        assert_eq!(state.opened_at, Some(1_030_000));

        clock.advance(10_000);
        assert!(matches!(
            call(&breaker, &invocations, Ok(1)).await,
            Err(GatewayError::CircuitOpen { .. })
        ));
        assert_eq!(invocations.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_concurrent_probe() {
        let (breaker, clock, _) = breaker();
        let invocations = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let _ = call(&breaker, &invocations, Err(timeout())).await;
        }
        invocations.store(0, Ordering::SeqCst);
        clock.advance(30_000);

        let calls = (0..8).map(|_| {
            let invocations = invocations.clone();
            breaker.execute("accounts", move || async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, GatewayError>(())
            })
        });
        let results = join_all(calls).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(GatewayError::CircuitOpen { .. })))
                .count(),
            7
        );
    }

    #[tokio::test]
    async fn stale_half_open_probe_is_reclaimed() {
        let (breaker, clock, store) = breaker();
        let stuck = BreakerState {
            state: BreakerPhase::HalfOpen,
            consecutive_failures: 5,
            last_failure_at: Some(1_000_000),
            opened_at: Some(1_000_000),
            probe_started_at: Some(1_000_000),
        };
        store
            .set(
                "breaker:accounts",
                &serde_json::to_string(&stuck).unwrap(),
                None,
            )
            .await
            .unwrap();
        let invocations = AtomicUsize::new(0);

        assert!(call(&breaker, &invocations, Ok(1)).await.is_err());
        clock.advance(30_000);
        assert_eq!(call(&breaker, &invocations, Ok(2)).await.unwrap(), 2);
        assert_eq!(
            breaker.snapshot("accounts").await.unwrap().state,
            BreakerPhase::Closed
        );
    }

    #[tokio::test]
    async fn instances_sharing_a_store_share_breaker_state() {
        let (first, _, store) = breaker();
        let second = CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            store,
            Arc::new(TrafficMetrics::new()),
        );
        let invocations = AtomicUsize::new(0);

        for _ in 0..5 {
            let _ = call(&first, &invocations, Err(timeout())).await;
        }
        assert!(matches!(
            call(&second, &invocations, Ok(1)).await,
            Err(GatewayError::CircuitOpen { .. })
        ));
        // Other services are unaffected.
        assert_eq!(
            second
                .execute("budgets", || async { Ok::<_, GatewayError>(3) })
                .await
                .unwrap(),
            3
        );
    }
}
