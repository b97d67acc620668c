use std::{
    collections::HashMap,
    net::IpAddr,
    time::{
        Duration,
        Instant,
    },
};

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};
use bytes::Bytes;
use http::{
    HeaderMap,
    Method,
    StatusCode,
    header::HeaderName,
};

use crate::{
    config::ServiceConfig,
    error::{GatewayError, GatewayResult},
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Opaque request handed to a downstream service.
#[derive(Debug, Clone)]
pub struct DownstreamRequest {
    pub request_id: String,
    pub method: Method,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl DownstreamResponse {
    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        for (name, value) in &self.headers {
            if should_forward_header(name) {
                response.headers_mut().append(name.clone(), value.clone());
            }
        }
        response
    }
}

/// The set of services reachable by name.
#[async_trait]
pub trait Downstream: Send + Sync {
    /// Performs one attempt. Statuses outside 2xx/3xx come back as
    /// [`GatewayError::Downstream`] so retry and breaker logic see them.
    async fn invoke(
        &self,
        service: &str,
        request: &DownstreamRequest,
    ) -> GatewayResult<DownstreamResponse>;
}

pub struct HttpDownstream {
    client: reqwest::Client,
    services: HashMap<String, ServiceConfig>,
}

impl HttpDownstream {
    pub fn new(services: Vec<ServiceConfig>) -> GatewayResult<Self> {
        let services = services
            .into_iter()
            .map(|svc| (svc.name.clone(), svc))
            .collect();

        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(Self { client, services })
    }
}

#[async_trait]
impl Downstream for HttpDownstream {
    async fn invoke(
        &self,
        service: &str,
        request: &DownstreamRequest,
    ) -> GatewayResult<DownstreamResponse> {
        let svc = self
            .services
            .get(service)
            .ok_or_else(|| GatewayError::Internal(format!("unknown service {service}")))?;

        let target_url = format!(
            "{}{}",
            svc.base_url.trim_end_matches('/'),
            request.path_and_query
        );

        let mut outbound = self
            .client
            .request(request.method.clone(), &target_url)
            .body(request.body.clone());

        for (name, value) in &request.headers {
            if should_forward_header(name) && name.as_str() != IDEMPOTENCY_KEY_HEADER {
                outbound = outbound.header(name, value);
            }
        }

        outbound = outbound.header("x-request-id", request.request_id.clone());
        if let Some(key) = &request.idempotency_key {
            outbound = outbound.header(IDEMPOTENCY_KEY_HEADER, key.clone());
        }
        if let Some(client_ip) = request.client_ip {
            outbound = outbound.header("x-forwarded-for", client_ip.to_string());
        }

        let started = Instant::now();
        let sent = outbound
            .timeout(Duration::from_millis(svc.timeout_ms))
            .send()
            .await;

        let reply = sent.map_err(|err| classify(service, err))?;
        let status = reply.status();
        let headers = reply.headers().clone();
        let body = reply
            .bytes()
            .await
            .map_err(|err| classify(service, err))?;

        tracing::debug!(
            service,
            request_id = %request.request_id,
            status = %status,
            latency_ms = started.elapsed().as_millis() as u64,
            "downstream responded"
        );

        if status.is_success() || status.is_redirection() {
            Ok(DownstreamResponse {
                status,
                headers,
                body,
            })
        } else {
            Err(GatewayError::Downstream {
                service: service.to_string(),
                status,
                headers,
                body,
            })
        }
    }
}

fn classify(service: &str, err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout {
            service: service.to_string(),
        }
    } else {
        GatewayError::Network {
            service: service.to_string(),
            message: err.to_string(),
        }
    }
}

fn should_forward_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        assert!(!should_forward_header(&HeaderName::from_static("connection")));
        assert!(!should_forward_header(&HeaderName::from_static("transfer-encoding")));
        assert!(should_forward_header(&HeaderName::from_static("content-type")));
        assert!(should_forward_header(&HeaderName::from_static("x-request-id")));
    }

    #[test]
    fn response_conversion_keeps_status_and_end_to_end_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));

        let response = DownstreamResponse {
            status: StatusCode::CREATED,
            headers,
            body: Bytes::from_static(b"{}"),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key("content-type"));
        assert!(!response.headers().contains_key("connection"));
    }

    #[tokio::test]
    async fn unknown_service_is_an_internal_error() {
        let downstream = HttpDownstream::new(Vec::new()).unwrap();
        let request = DownstreamRequest {
            request_id: "r-1".to_string(),
            method: Method::GET,
            path_and_query: "/accounts".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_ip: None,
            idempotency_key: None,
        };

        let err = downstream.invoke("ghost", &request).await.unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }
}
