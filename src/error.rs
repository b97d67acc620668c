use axum::{
    Json,
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Every way a request can fail inside the traffic-control layer.
///
/// The enum is `Clone` because the outcome of a shared dedup fetch is handed to
/// every caller awaiting it.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("circuit open for service {service}")]
    CircuitOpen { service: String },
    #[error("idempotency key {key} was reused with a different request")]
    IdempotencyConflict { key: String },
    #[error("request with idempotency key {key} is still in progress")]
    IdempotencyInProgress { key: String },
    #[error("gave up after {attempts} attempts: {cause}")]
    RetryExhausted {
        attempts: u32,
        cause: Box<GatewayError>,
    },
    #[error("downstream {service} responded with {status}")]
    Downstream {
        service: String,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    #[error("downstream {service} timed out")]
    Timeout { service: String },
    #[error("network error calling {service}: {message}")]
    Network { service: String, message: String },
    #[error("no route matched the request")]
    RouteNotFound,
    #[error("request body exceeds configured limit")]
    PayloadTooLarge,
    #[error("shared store error: {0}")]
    Store(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    error_code: &'a str,
    message: &'a str,
    status_code: u16,
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::IdempotencyConflict { .. } => "idempotency_conflict",
            Self::IdempotencyInProgress { .. } => "idempotency_in_progress",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Downstream { .. } => "downstream_error",
            Self::Timeout { .. } => "downstream_timeout",
            Self::Network { .. } => "downstream_unreachable",
            Self::RouteNotFound => "route_not_found",
            Self::PayloadTooLarge => "payload_too_large",
            Self::Store(_) => "store_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Client-facing text. Never carries counters, breaker internals or store
    /// details; those go to the logs.
    pub fn message(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "Rate limit exceeded. Please try again later.",
            Self::CircuitOpen { .. } => "Service temporarily unavailable",
            Self::IdempotencyConflict { .. } => {
                "Idempotency-Key was already used with a different request"
            }
            Self::IdempotencyInProgress { .. } => {
                "A request with this Idempotency-Key is still being processed"
            }
            Self::RetryExhausted { .. } => "Service temporarily unavailable",
            Self::Downstream { .. } => "Downstream service returned an error",
            Self::Timeout { .. } => "Downstream service timed out",
            Self::Network { .. } => "Downstream service unreachable",
            Self::RouteNotFound => "No route matched the request",
            Self::PayloadTooLarge => "Request body exceeds configured limit",
            Self::Store(_) | Self::Internal(_) => "Internal server error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::IdempotencyConflict { .. } | Self::IdempotencyInProgress { .. } => {
                StatusCode::CONFLICT
            }
            Self::RetryExhausted { cause, .. } => cause.status(),
            Self::Downstream { status, .. } => *status,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Network { .. } => StatusCode::BAD_GATEWAY,
            Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Network errors, timeouts and 429/502/503/504 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network { .. } => true,
            Self::Downstream { status, .. } => matches!(
                *status,
                StatusCode::TOO_MANY_REQUESTS
                    | StatusCode::BAD_GATEWAY
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT
            ),
            _ => false,
        }
    }

    /// Errors that say something about the health of the downstream service.
    pub fn is_downstream_failure(&self) -> bool {
        matches!(
            self,
            Self::Downstream { .. } | Self::Timeout { .. } | Self::Network { .. }
        )
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // Terminal downstream answers go back to the client untouched.
        if let Self::Downstream {
            status,
            headers,
            body,
            ..
        } = self
        {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            if let Some(content_type) = headers.get(header::CONTENT_TYPE) {
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, content_type.clone());
            }
            return response;
        }

        let status = self.status();
        let mut response = (
            status,
            Json(ErrorBody {
                error_code: self.code(),
                message: self.message(),
                status_code: status.as_u16(),
            }),
        )
            .into_response();

        if let Self::RateLimited { retry_after_secs } = self
            && let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }

        response
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
