use std::future::Future;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{
    HeaderMap,
    HeaderName,
    HeaderValue,
    StatusCode,
};
use serde::{Deserialize, Serialize};

use super::DedupCache;
use crate::{
    downstream::DownstreamResponse,
    error::{GatewayError, GatewayResult},
};

/// How many times a claim is retried when the competing record vanishes
/// between the failed claim and the read.
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Persisted outcome of a keyed mutation. `result` stays empty while the first
/// request is still being performed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub request_hash: String,
    pub result: Option<StoredResponse>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body_hex: String,
}

impl From<&DownstreamResponse> for StoredResponse {
    fn from(response: &DownstreamResponse) -> Self {
        Self {
            status: response.status.as_u16(),
            headers: response
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body_hex: hex::encode(&response.body),
        }
    }
}

impl TryFrom<StoredResponse> for DownstreamResponse {
    type Error = GatewayError;

    fn try_from(stored: StoredResponse) -> GatewayResult<Self> {
        let status = StatusCode::from_u16(stored.status)
            .map_err(|e| GatewayError::Internal(format!("stored status: {e}")))?;
        let body = hex::decode(&stored.body_hex)
            .map_err(|e| GatewayError::Internal(format!("stored body: {e}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in stored.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.append(name, value);
            }
        }

        Ok(Self {
            status,
            headers,
            body: Bytes::from(body),
        })
    }
}

#[derive(Debug, Clone)]
pub struct IdempotentResponse {
    pub response: DownstreamResponse,
    pub replayed: bool,
}

impl DedupCache {
    /// Performs a mutation at most once per idempotency key.
    ///
    /// The first request claims the key with a pending record. A later request
    /// with the same key and the same `request_hash` replays the stored
    /// response without calling `perform`; a different hash is rejected with
    /// [`GatewayError::IdempotencyConflict`]. Only successful outcomes are
    /// kept, so a failed mutation can be retried under the same key.
    ///
    /// The pending claim only lives as long as the hard fetch timeout, which
    /// also bounds `perform`. A claim left behind by a dropped request expires
    /// on its own instead of blocking retries for the whole retention period.
    pub async fn with_idempotency<F, Fut>(
        &self,
        service: &str,
        idempotency_key: &str,
        request_hash: &str,
        perform: F,
    ) -> GatewayResult<IdempotentResponse>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<DownstreamResponse>>,
    {
        let store_key = format!("idempotency:{idempotency_key}");
        let pending = IdempotencyRecord {
            idempotency_key: idempotency_key.to_string(),
            request_hash: request_hash.to_string(),
            result: None,
            created_at: self.record_time(),
        };
        let pending_json = serde_json::to_string(&pending)?;

        let mut attempts = 0;
        loop {
            if self
                .store
                .compare_and_swap(&store_key, None, &pending_json, Some(self.fetch_timeout))
                .await?
            {
                break;
            }
            if let Some(raw) = self.store.get(&store_key).await? {
                let existing: IdempotencyRecord = serde_json::from_str(&raw)?;
                return self.resolve_existing(existing, request_hash);
            }
            attempts += 1;
            if attempts >= MAX_CLAIM_ATTEMPTS {
                return Err(GatewayError::Store(format!(
                    "could not claim idempotency key {idempotency_key}"
                )));
            }
        }

        let outcome = tokio::time::timeout(self.fetch_timeout, perform())
            .await
            .unwrap_or_else(|_| {
                Err(GatewayError::Timeout {
                    service: service.to_string(),
                })
            });

        match outcome {
            Ok(response) => {
                let completed = IdempotencyRecord {
                    result: Some(StoredResponse::from(&response)),
                    ..pending
                };
                self.persist(&store_key, &pending_json, &completed).await;
                Ok(IdempotentResponse {
                    response,
                    replayed: false,
                })
            }
            Err(err) => {
                if let Err(store_err) = self.store.delete(&store_key).await {
                    tracing::warn!(
                        idempotency_key,
                        error = %store_err,
                        "failed to release idempotency claim"
                    );
                }
                Err(err)
            }
        }
    }

    fn record_time(&self) -> DateTime<Utc> {
        i64::try_from(self.clock.now_millis())
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_default()
    }

    fn resolve_existing(
        &self,
        existing: IdempotencyRecord,
        request_hash: &str,
    ) -> GatewayResult<IdempotentResponse> {
        if existing.request_hash != request_hash {
            self.metrics.idempotency_conflict();
            tracing::warn!(
                idempotency_key = %existing.idempotency_key,
                "idempotency key reused with a different request"
            );
            return Err(GatewayError::IdempotencyConflict {
                key: existing.idempotency_key,
            });
        }

        match existing.result {
            Some(stored) => {
                self.metrics.idempotent_replay();
                tracing::info!(
                    idempotency_key = %existing.idempotency_key,
                    "replaying stored response"
                );
                Ok(IdempotentResponse {
                    response: stored.try_into()?,
                    replayed: true,
                })
            }
            None => Err(GatewayError::IdempotencyInProgress {
                key: existing.idempotency_key,
            }),
        }
    }

    async fn persist(&self, store_key: &str, pending_json: &str, completed: &IdempotencyRecord) {
        let outcome = match serde_json::to_string(completed) {
            Ok(json) => {
                self.store
                    .compare_and_swap(
                        store_key,
                        Some(pending_json),
                        &json,
                        Some(self.idempotency_retention),
                    )
                    .await
            }
            Err(err) => Err(err.into()),
        };

        match outcome {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                idempotency_key = %completed.idempotency_key,
                "pending idempotency record changed before completion"
            ),
            Err(err) => tracing::warn!(
                idempotency_key = %completed.idempotency_key,
                error = %err,
                "failed to persist idempotent response"
            ),
        }
    }
}
