use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::{
    collections::HashMap,
    net::IpAddr,
    time::Instant,
};

use crate::{
    config::RouteConfig,
    ratelimit::RouteClass,
};

/// Client identity used when neither the key header nor a peer address is
/// available.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    pub client_key: String,
    pub started_at: Instant,
    pub route: Option<RouteConfig>,
    /// Values the pipeline wants echoed back as response headers.
    pub metadata: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            method,
            uri,
            headers,
            body,
            client_ip,
            client_key: ANONYMOUS_CLIENT.to_string(),
            started_at: Instant::now(),
            route: None,
            metadata: HashMap::new(),
        }
    }

    /// Identifies the caller by `key_header`, then by peer address.
    pub fn identify(&mut self, key_header: &str) {
        self.client_key = self
            .headers
            .get(key_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
            .or_else(|| self.client_ip.map(|ip| ip.to_string()))
            .unwrap_or_else(|| ANONYMOUS_CLIENT.to_string());
    }

    pub fn route_class(&self) -> RouteClass {
        self.route
            .as_ref()
            .map(|r| r.class)
            .unwrap_or(RouteClass::Public)
    }

    pub fn is_read(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD)
    }
}
