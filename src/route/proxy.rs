//! Forwarding plumbing shared by all strategies
//!
//! Buffers the downstream request once, rewrites it for an upstream target
//! (prefix rewrite, hop-by-hop stripping, `X-Forwarded-For`), sends it over
//! a pooled reqwest client with timing, and converts the upstream answer
//! back into an axum response.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, header};
use bytes::Bytes;
use url::Url;

use crate::error::{Error, Result};

/// Server header advertised on proxied responses.
pub const SERVER_NAME: &str = concat!("depoy/", env!("CARGO_PKG_VERSION"));

/// Hop-by-hop headers, removed before the request is sent upstream.
/// http://www.w3.org/Protocols/rfc2616/rfc2616-sec13.html
pub const HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// A downstream request buffered into an owned, resendable form.
///
/// The body is read fully so a shadow strategy can replay it to a second
/// backend without consuming the original.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<String>,
    pub downstream_addr: String,
}

impl ProxyRequest {
    /// Buffer an incoming axum request.
    pub async fn buffer(req: Request<Body>, peer: Option<std::net::SocketAddr>) -> Result<Self> {
        let (parts, body) = req.into_parts();
        let path = parts.uri.path().to_string();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| path.clone());
        let body = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| Error::UpstreamTransport {
                reason: format!("failed to read downstream body: {e}"),
                timeout: false,
            })?;
        Ok(ProxyRequest {
            method: parts.method,
            path,
            path_and_query,
            headers: parts.headers,
            body,
            client_ip: peer.map(|addr| addr.ip().to_string()),
            downstream_addr: peer.map(|addr| addr.to_string()).unwrap_or_default(),
        })
    }

    /// Value of a cookie carried in the `Cookie` header, if present.
    pub fn cookie(&self, name: &str) -> Option<String> {
        for value in self.headers.get_all(header::COOKIE) {
            let raw = value.to_str().ok()?;
            for pair in raw.split(';') {
                let pair = pair.trim();
                if let Some((k, v)) = pair.split_once('=') {
                    if k == name {
                        return Some(v.to_string());
                    }
                }
            }
        }
        None
    }

    /// Headers for the upstream request: everything the client sent, minus
    /// hop-by-hop headers and host, with the client appended to
    /// `X-Forwarded-For`.
    pub fn upstream_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        for name in HOP_HEADERS {
            headers.remove(name);
        }
        headers.remove(header::HOST);

        if let Some(client_ip) = &self.client_ip {
            let merged = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{prior}, {client_ip}"),
                None => client_ip.clone(),
            };
            if let Ok(value) = HeaderValue::from_str(&merged) {
                headers.insert(
                    HeaderName::from_static("x-forwarded-for"),
                    value,
                );
            }
        }
        headers
    }
}

/// Rewrite the request path for a target: the route prefix is replaced by
/// the rewrite prefix when one is set, then joined onto the backend address.
pub fn upstream_url(addr: &Url, path_and_query: &str, prefix: &str, rewrite: Option<&str>) -> String {
    let rewritten = match rewrite {
        Some(rewrite) if path_and_query.starts_with(prefix) => {
            format!("{rewrite}{}", &path_and_query[prefix.len()..])
        }
        _ => path_and_query.to_string(),
    };
    format!("{}{rewritten}", addr.as_str().trim_end_matches('/'))
}

/// What came back from an upstream, with timings in milliseconds.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Total time until the body was fully read.
    pub response_time: f64,
    /// Time until response headers arrived.
    pub connect_time: f64,
}

/// Pooled HTTP/1.1 client for one route's upstreams
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(timeout: Duration, idle_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(idle_timeout)
            .http1_only()
            .build()
            .map_err(|e| Error::Config(format!("upstream client: {e}")))?;
        Ok(UpstreamClient { client })
    }

    /// Send one request upstream and buffer the full response.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        let started = Instant::now();
        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::upstream(&e))?;
        let connect_time = started.elapsed().as_secs_f64() * 1000.0;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| Error::upstream(&e))?;
        let response_time = started.elapsed().as_secs_f64() * 1000.0;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
            response_time,
            connect_time,
        })
    }
}

/// Convert an upstream answer into the downstream response: status and body
/// forwarded verbatim, headers copied minus hop-by-hop, `Server` set.
pub fn downstream_response(upstream: UpstreamResponse) -> Response<Body> {
    let mut builder = Response::builder().status(upstream.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = upstream.headers;
        for name in HOP_HEADERS {
            headers.remove(name);
        }
        headers.remove(header::CONTENT_LENGTH); // recomputed for the buffered body
        headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    }
    builder.body(Body::from(upstream.body)).unwrap_or_else(|_| {
        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        res
    })
}

/// Greatest common divisor over a weight list; 0 when the list is empty or
/// all-zero.
pub fn gcd_all(weights: &[u8]) -> u8 {
    fn gcd(a: u8, b: u8) -> u8 {
        let (mut a, mut b) = (a, b);
        while b != 0 {
            let t = b;
            b = a % b;
            a = t;
        }
        a
    }
    weights.iter().copied().fold(0, gcd)
}

/// A `Set-Cookie` value carrying the session affinity cookie.
pub fn session_cookie(name: &str, value: &str, ttl: Duration) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!("{name}={value}; Max-Age={}; Path=/", ttl.as_secs())).ok()
}
