//! Reverse-proxy data path
//!
//! Routes `/kubernetes/{tunnelID}/...` to the remote API server through the
//! tunnel. Two proxy engines share the cached per-tunnel client and the
//! request rewriting: the standard engine for plain and websocket traffic,
//! and the upgrade-aware engine for SPDY stream protocols (`kubectl exec`,
//! `attach`, `port-forward`, `cp`). A single engine that speaks both has
//! historically mis-handled WebSocket framing when wrapped by the
//! upgrade-aware helper, so the branches stay separate.

pub mod client;

pub use client::{ClientCache, ClientKey, ProxyClient, TunnelConnector};

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::metrics::{observe_response_code, REQUEST_LATENCY};
use crate::server::AppState;

/// Default per-request proxy timeout when the query omits `timeout`
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors on the data path, each mapped to an HTTP status
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No live session for the tunnel id. 500, not 404: the tunnel is
    /// lookup-by-registry, and the caller is expected to retry.
    #[error("no session for tunnel {0}")]
    NoSession(String),

    /// Kubeconfig for the tunnel could not be resolved
    #[error("kubeconfig unavailable: {0}")]
    Kubeconfig(String),

    /// Upgrade header carries a scheme we do not proxy
    #[error("unsupported upgrade scheme: {0}")]
    UnsupportedUpgrade(String),

    /// Tunnel lost mid-request or remote dial refused
    #[error("bad gateway: {0}")]
    BadGateway(String),

    /// Request body exceeds the externally-facing limit
    #[error("request body too large")]
    BodyTooLarge,

    /// Anything else
    #[error("proxy error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// The HTTP status this error surfaces as
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoSession(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Kubeconfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::UnsupportedUpgrade(_) => StatusCode::BAD_REQUEST,
            ProxyError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ProxyError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = format!(
            r#"{{"kind":"Status","apiVersion":"v1","status":"Failure","message":"{}","code":{}}}"#,
            self,
            status.as_u16()
        );
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// How a request is proxied, decided by the Upgrade header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyMode {
    /// Standard reverse proxy (plain HTTP and websocket upgrades)
    Standard,
    /// Upgrade-aware path for SPDY stream protocols
    Spdy,
}

/// Classify a request by its `Upgrade` header (case-insensitive)
pub fn classify_upgrade(headers: &HeaderMap) -> Result<ProxyMode, ProxyError> {
    let Some(value) = headers.get(header::UPGRADE) else {
        return Ok(ProxyMode::Standard);
    };
    let value = value.to_str().unwrap_or_default();
    let lower = value.to_ascii_lowercase();
    if lower.is_empty() || lower == "websocket" {
        Ok(ProxyMode::Standard)
    } else if lower.starts_with("spdy/") {
        Ok(ProxyMode::Spdy)
    } else {
        Err(ProxyError::UnsupportedUpgrade(value.to_string()))
    }
}

/// Parse the `timeout` query parameter (seconds), defaulting to 15
pub fn parse_timeout(query: Option<&str>) -> Duration {
    query
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("timeout="))
        })
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_PROXY_TIMEOUT)
}

/// Path parameters of the `/kubernetes/{tunnel_id}/{*rest}` route
#[derive(Debug, Deserialize)]
pub struct KubeapiPath {
    /// Tunnel to proxy through
    pub tunnel_id: String,
    /// Remainder of the API path
    pub rest: String,
}

/// Hop-by-hop headers never forwarded to the upstream
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Rewrite the inbound request for the remote API server.
///
/// Scheme becomes `https`, the host `kubernetes.default.svc`, the path the
/// captured remainder; method, query, body, and non-hop-by-hop headers are
/// preserved. The Upgrade/Connection pair survives only for HTTP/1.1
/// requests — upgrades do not exist in HTTP/2 semantics, so there the
/// header is dropped. Shared by both proxy engines.
pub fn rewrite_request(
    method: Method,
    version: Version,
    headers: &HeaderMap,
    query: Option<&str>,
    rest: &str,
    body: Body,
) -> Result<http::Request<Body>, ProxyError> {
    let path_and_query = match query {
        Some(q) if !q.is_empty() => format!("/{rest}?{q}"),
        _ => format!("/{rest}"),
    };
    let uri = Uri::builder()
        .scheme("https")
        .authority("kubernetes.default.svc")
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ProxyError::Internal(format!("failed to build upstream URI: {e}")))?;

    let keep_upgrade = headers.contains_key(header::UPGRADE) && version <= Version::HTTP_11;

    let mut outbound = http::Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .map_err(|e| ProxyError::Internal(format!("failed to build upstream request: {e}")))?;

    let out_headers = outbound.headers_mut();
    for (name, value) in headers {
        if name == header::HOST {
            continue;
        }
        let is_hop_by_hop = HOP_BY_HOP.contains(&name.as_str());
        let is_upgrade_pair = name == header::UPGRADE || name == header::CONNECTION;
        if is_hop_by_hop && !(keep_upgrade && is_upgrade_pair) {
            continue;
        }
        out_headers.append(name.clone(), value.clone());
    }
    out_headers.insert(
        header::HOST,
        HeaderValue::from_static("kubernetes.default.svc"),
    );

    Ok(outbound)
}

/// Handler for `/kubernetes/{tunnel_id}/{*rest}`
#[instrument(
    skip(state, req),
    fields(tunnel_id = %params.tunnel_id, otel.kind = "server")
)]
pub async fn kubeapi_handler(
    State(state): State<AppState>,
    Path(params): Path<KubeapiPath>,
    req: http::Request<Body>,
) -> Response {
    let start = Instant::now();
    let response = proxy_request(&state, &params, req)
        .await
        .unwrap_or_else(|e| {
            warn!(tunnel_id = %params.tunnel_id, error = %e, "Proxy request failed");
            e.into_response()
        });

    observe_response_code(response.status().as_u16());
    REQUEST_LATENCY.observe(start.elapsed().as_secs_f64());
    response
}

async fn proxy_request(
    state: &AppState,
    params: &KubeapiPath,
    req: http::Request<Body>,
) -> Result<Response, ProxyError> {
    let timeout = parse_timeout(req.uri().query());
    let mode = classify_upgrade(req.headers())?;

    let client = state
        .clients
        .get_or_create(&params.tunnel_id, timeout)
        .await?;

    debug!(
        tunnel_id = %params.tunnel_id,
        rest = %params.rest,
        ?mode,
        timeout_secs = timeout.as_secs(),
        "Proxying request"
    );

    let (mut parts, body) = req.into_parts();
    let client_upgrade = parts.extensions.remove::<OnUpgrade>();

    // Stream protocols carry no request body; the byte stream starts after
    // the 101
    let body = match mode {
        ProxyMode::Standard => body,
        ProxyMode::Spdy => Body::empty(),
    };
    let outbound = rewrite_request(
        parts.method,
        parts.version,
        &parts.headers,
        parts.uri.query(),
        &params.rest,
        body,
    )?;

    match mode {
        ProxyMode::Standard => proxy_standard(&client, outbound, timeout, client_upgrade).await,
        ProxyMode::Spdy => proxy_upgrade(&client, outbound, client_upgrade).await,
    }
}

/// Standard engine: forward the request and stream the response. A `101
/// Switching Protocols` answer (websocket) flips into bidirectional
/// bridging.
async fn proxy_standard(
    client: &ProxyClient,
    outbound: http::Request<Body>,
    timeout: Duration,
    client_upgrade: Option<OnUpgrade>,
) -> Result<Response, ProxyError> {
    let response = tokio::time::timeout(timeout, client.client.request(outbound))
        .await
        .map_err(|_| ProxyError::BadGateway("upstream request timed out".to_string()))?
        .map_err(|e| ProxyError::BadGateway(format!("upstream request failed: {e}")))?;

    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        return bridge_upgrade(response, client_upgrade);
    }

    let (mut parts, body) = response.into_parts();
    for name in HOP_BY_HOP {
        parts.headers.remove(name);
    }
    Ok(Response::from_parts(parts, Body::new(body)))
}

/// Upgrade-aware engine for SPDY stream-protocol negotiation. The upstream's
/// non-101 responses (e.g. RBAC denials) pass through verbatim.
async fn proxy_upgrade(
    client: &ProxyClient,
    outbound: http::Request<Body>,
    client_upgrade: Option<OnUpgrade>,
) -> Result<Response, ProxyError> {
    let response = client
        .client
        .request(outbound)
        .await
        .map_err(|e| ProxyError::BadGateway(format!("upstream upgrade failed: {e}")))?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        let (parts, body) = response.into_parts();
        return Ok(Response::from_parts(parts, Body::new(body)));
    }

    bridge_upgrade(response, client_upgrade)
}

/// Bridge the two upgraded connections and answer the client with the
/// upstream's 101
fn bridge_upgrade(
    mut upstream: http::Response<hyper::body::Incoming>,
    client_upgrade: Option<OnUpgrade>,
) -> Result<Response, ProxyError> {
    let client_upgrade = client_upgrade.ok_or_else(|| {
        ProxyError::Internal("client connection does not support upgrades".to_string())
    })?;
    let upstream_upgrade = hyper::upgrade::on(&mut upstream);

    tokio::spawn(async move {
        let (client_io, upstream_io) = match tokio::try_join!(client_upgrade, upstream_upgrade) {
            Ok(both) => both,
            Err(e) => {
                warn!(error = %e, "Upgrade completion failed");
                return;
            }
        };
        let mut client_io = TokioIo::new(client_io);
        let mut upstream_io = TokioIo::new(upstream_io);
        match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
            Ok((from_client, from_upstream)) => {
                debug!(from_client, from_upstream, "Upgraded stream ended");
            }
            Err(e) => debug!(error = %e, "Upgraded stream bridge error"),
        }
    });

    let (parts, _) = upstream.into_parts();
    Ok(Response::from_parts(parts, Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderName;

    fn headers_with_upgrade(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, value.parse().unwrap());
        headers
    }

    #[test]
    fn test_classify_no_upgrade_is_standard() {
        assert_eq!(
            classify_upgrade(&HeaderMap::new()).unwrap(),
            ProxyMode::Standard
        );
    }

    #[test]
    fn test_classify_websocket_is_standard() {
        assert_eq!(
            classify_upgrade(&headers_with_upgrade("websocket")).unwrap(),
            ProxyMode::Standard
        );
        assert_eq!(
            classify_upgrade(&headers_with_upgrade("WebSocket")).unwrap(),
            ProxyMode::Standard
        );
    }

    #[test]
    fn test_classify_spdy_is_upgrade_aware() {
        assert_eq!(
            classify_upgrade(&headers_with_upgrade("SPDY/3.1")).unwrap(),
            ProxyMode::Spdy
        );
        assert_eq!(
            classify_upgrade(&headers_with_upgrade("spdy/3.1")).unwrap(),
            ProxyMode::Spdy
        );
    }

    #[test]
    fn test_classify_unknown_scheme_rejected() {
        let err = classify_upgrade(&headers_with_upgrade("h2c")).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_timeout_default_and_explicit() {
        assert_eq!(parse_timeout(None), Duration::from_secs(15));
        assert_eq!(parse_timeout(Some("watch=true")), Duration::from_secs(15));
        assert_eq!(parse_timeout(Some("timeout=30")), Duration::from_secs(30));
        assert_eq!(
            parse_timeout(Some("watch=true&timeout=120")),
            Duration::from_secs(120)
        );
        assert_eq!(parse_timeout(Some("timeout=abc")), Duration::from_secs(15));
    }

    #[test]
    fn test_no_session_maps_to_500() {
        // Property 8: unknown tunnel is 500, not 404
        assert_eq!(
            ProxyError::NoSession("c1".to_string()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ProxyError::UnsupportedUpgrade("h2c".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::BadGateway("lost".to_string()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ProxyError::BodyTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_error_response_is_k8s_status_json() {
        let response = ProxyError::NoSession("c1".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_rewrite_sets_scheme_host_and_path() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "gateway.example.com".parse().unwrap());
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());

        let outbound = rewrite_request(
            Method::GET,
            Version::HTTP_11,
            &headers,
            Some("watch=true"),
            "api/v1/namespaces",
            Body::empty(),
        )
        .unwrap();

        assert_eq!(outbound.uri().scheme_str(), Some("https"));
        assert_eq!(outbound.uri().host(), Some("kubernetes.default.svc"));
        assert_eq!(outbound.uri().path(), "/api/v1/namespaces");
        assert_eq!(outbound.uri().query(), Some("watch=true"));
        assert_eq!(
            outbound.headers().get(header::HOST).unwrap(),
            "kubernetes.default.svc"
        );
        assert_eq!(
            outbound.headers().get(header::ACCEPT).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_rewrite_strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
        headers.insert(
            HeaderName::from_static("proxy-authorization"),
            "Basic xyz".parse().unwrap(),
        );
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());

        let outbound = rewrite_request(
            Method::POST,
            Version::HTTP_11,
            &headers,
            None,
            "api/v1/pods",
            Body::empty(),
        )
        .unwrap();

        assert!(outbound.headers().get(header::CONNECTION).is_none());
        assert!(outbound.headers().get(header::TRANSFER_ENCODING).is_none());
        assert!(outbound.headers().get("proxy-authorization").is_none());
        // End-to-end auth headers survive
        assert_eq!(
            outbound.headers().get(header::AUTHORIZATION).unwrap(),
            "Bearer abc"
        );
    }

    #[test]
    fn test_rewrite_preserves_upgrade_for_http11() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, "SPDY/3.1".parse().unwrap());
        headers.insert(header::CONNECTION, "Upgrade".parse().unwrap());

        let outbound = rewrite_request(
            Method::POST,
            Version::HTTP_11,
            &headers,
            None,
            "api/v1/namespaces/default/pods/p/exec",
            Body::empty(),
        )
        .unwrap();

        assert_eq!(outbound.headers().get(header::UPGRADE).unwrap(), "SPDY/3.1");
        assert_eq!(outbound.headers().get(header::CONNECTION).unwrap(), "Upgrade");
    }

    #[test]
    fn test_rewrite_drops_upgrade_for_http2() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, "websocket".parse().unwrap());

        let outbound = rewrite_request(
            Method::GET,
            Version::HTTP_2,
            &headers,
            None,
            "api/v1/pods",
            Body::empty(),
        )
        .unwrap();

        assert!(outbound.headers().get(header::UPGRADE).is_none());
    }
}
