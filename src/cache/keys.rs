use http::HeaderMap;
use sha2::{Digest, Sha256};

/// Headers a downstream may authorise a read on, besides the client key header.
const CREDENTIAL_HEADERS: [&str; 2] = ["authorization", "cookie"];

/// Sorts query pairs so `?b=2&a=1` and `?a=1&b=2` coalesce onto one key.
pub fn normalize_query(query: Option<&str>) -> String {
    let mut pairs: Vec<&str> = query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .collect();
    pairs.sort_unstable();
    pairs.join("&")
}

/// Deterministic dedup key. The readable `{service}:{path}` head is what
/// invalidation prefixes match on; the digest tail separates methods, query
/// strings and (for per-client routes) identities.
pub fn dedup_key(service: &str, method: &str, path: &str, query: Option<&str>, scope: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update([0]);
    hasher.update(scope.as_bytes());
    hasher.update([0]);
    hasher.update(normalize_query(query).as_bytes());
    let digest = hasher.finalize();
    format!("{service}:{path}:{}", hex::encode(&digest[..12]))
}

/// Identity an authenticated read is cached under. The resolved client key
/// alone can be a shared peer address, so every credential header the request
/// carries is folded in as well.
pub fn credential_scope(client_key: &str, headers: &HeaderMap, key_header: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_key.as_bytes());
    let mut absorb = |name: &str| {
        for value in headers.get_all(name) {
            hasher.update([0]);
            hasher.update(name.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.as_bytes());
        }
    };
    for name in CREDENTIAL_HEADERS {
        absorb(name);
    }
    absorb(key_header);
    hex::encode(hasher.finalize())
}

/// Prefix covering every cached read of `service`.
pub fn service_prefix(service: &str) -> String {
    format!("{service}:")
}

/// Fingerprint of a mutating request, bound to its idempotency key.
pub fn request_hash(method: &str, path: &str, query: Option<&str>, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update([0]);
    hasher.update(path.as_bytes());
    hasher.update([0]);
    hasher.update(normalize_query(query).as_bytes());
    hasher.update([0]);
    hasher.update(body);
    hex::encode(hasher.finalize())
}
