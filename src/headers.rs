//! Header views exchanged with the proxy, and the translation between HTTP/1
//! request-line fields and the proxy's header-only abstraction.
//!
//! Request-line information (method, path, query, authority) and the response
//! status travel through the proxy as reserved in-process header keys. They
//! are injected at ingress, consumed and removed at egress, and must never
//! appear on the wire.

use http::{HeaderMap, HeaderValue, Method};
use std::net::SocketAddr;

pub const MOSN_HOST: &str = "mosn-host";
pub const ISTIO_AUTHORITY: &str = "istio-authority";
pub const MOSN_METHOD: &str = "mosn-method";
pub const MOSN_PATH: &str = "mosn-path";
pub const MOSN_QUERYSTRING: &str = "mosn-querystring";
pub const MOSN_STATUS: &str = "x-mosn-status";

pub const INTERNAL_KEYS: [&str; 6] = [
    MOSN_HOST,
    ISTIO_AUTHORITY,
    MOSN_METHOD,
    MOSN_PATH,
    MOSN_QUERYSTRING,
    MOSN_STATUS,
];

/// Request-shaped header view.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders(pub HeaderMap);

/// Response-shaped header view.
#[derive(Debug, Clone, Default)]
pub struct ResponseHeaders(pub HeaderMap);

/// The two header shapes `append_headers` accepts. A request-shaped view on
/// the server side is the hijack path: the proxy answers straight from the
/// request headers without contacting an upstream.
#[derive(Debug, Clone)]
pub enum StreamHeaders {
    Request(RequestHeaders),
    Response(ResponseHeaders),
}

impl RequestHeaders {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    pub fn set(&mut self, key: &'static str, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.0.insert(key, value);
        }
    }

    /// Remove `key`, returning its previous value.
    pub fn take(&mut self, key: &str) -> Option<String> {
        self.0
            .remove(key)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
    }

    pub fn copy_to(&self, dst: &mut HeaderMap) {
        for (name, value) in self.0.iter() {
            dst.insert(name.clone(), value.clone());
        }
    }
}

impl ResponseHeaders {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    pub fn set(&mut self, key: &'static str, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.0.insert(key, value);
        }
    }

    pub fn take(&mut self, key: &str) -> Option<String> {
        self.0
            .remove(key)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
    }

    pub fn copy_to(&self, dst: &mut HeaderMap) {
        for (name, value) in self.0.iter() {
            dst.insert(name.clone(), value.clone());
        }
    }
}

/// Ingress (wire → internal): expose the request-line fields to the routing
/// layer as ordinary headers. The query-string key is set only when a query
/// is present.
pub fn inject_request_line(
    headers: &mut RequestHeaders,
    method: &Method,
    path: &str,
    query: Option<&str>,
    host: &str,
) {
    headers.set(MOSN_HOST, host);
    headers.set(ISTIO_AUTHORITY, host);
    headers.set(MOSN_METHOD, method.as_str());
    headers.set(MOSN_PATH, path);
    if let Some(query) = query {
        if !query.is_empty() {
            headers.set(MOSN_QUERYSTRING, query);
        }
    }
}

/// Request-line fields reconstructed from the internal header keys at egress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    /// `None` when the method key was absent; the caller keeps its default.
    pub method: Option<String>,
    pub path: String,
    pub query: Option<String>,
    pub host: String,
}

/// Egress (internal → wire): strip every internal key from the view and
/// rebuild the request-line fields they carried. The path defaults to `/`;
/// the authority key wins over the host key, and both fall back to the remote
/// peer address.
pub fn extract_request_line(
    headers: &mut RequestHeaders,
    remote_addr: Option<SocketAddr>,
) -> RequestLine {
    let path = headers
        .take(MOSN_PATH)
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string());

    let query = headers.take(MOSN_QUERYSTRING).filter(|q| !q.is_empty());

    let method = headers.take(MOSN_METHOD);

    let mosn_host = headers.take(MOSN_HOST);
    let authority = headers.take(ISTIO_AUTHORITY);
    let host = authority
        .or(mosn_host)
        .or_else(|| remote_addr.map(|addr| addr.to_string()))
        .unwrap_or_default();

    RequestLine {
        method,
        path,
        query,
        host,
    }
}
