//! External-surface middleware
//!
//! Requests arriving on the configured external host pass a JWT check, an
//! OPA policy decision, and a 100 MiB body limit. Requests on any other host
//! (in-cluster callers) pass through untouched.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body_util::Limited;
use tracing::info;

use crate::authorizer::bearer_token;
use crate::server::AppState;

/// Maximum request body size on the externally-facing route
pub const MAX_BODY_SIZE: usize = 100 * 1024 * 1024;

/// Extract the tunnel id from a `/kubernetes/{id}/...` path
pub fn extract_tunnel_id(path: &str) -> Option<&str> {
    let mut segments = path.split('/');
    let _leading = segments.next();
    match (segments.next(), segments.next()) {
        (Some("kubernetes"), Some(id)) if !id.is_empty() => Some(id),
        _ => None,
    }
}

/// Derive the project id from a tunnel id.
///
/// The tunnel id is a UUID followed by a hyphen and a cluster name; the
/// project id is the UUID, i.e. the first five hyphen-separated segments.
pub fn extract_project_id(tunnel_id: &str) -> Option<String> {
    let segments: Vec<&str> = tunnel_id.split('-').collect();
    if segments.len() < 6 {
        return None;
    }
    Some(segments[0..5].join("-"))
}

/// Compare the request's Host header to the external host, ignoring ports
fn host_matches(headers: &HeaderMap, external_host: &str) -> bool {
    let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let host = host.split(':').next().unwrap_or(host);
    let external = external_host.split(':').next().unwrap_or(external_host);
    host.eq_ignore_ascii_case(external)
}

/// Middleware guarding `/kubernetes` on the external host.
///
/// Internal callers (any other Host) are proxied without authentication;
/// the remote API server still enforces its own RBAC end to end.
pub async fn external_surface(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(external_host) = state.external_host.as_deref() else {
        return next.run(req).await;
    };
    if !host_matches(req.headers(), external_host) {
        return next.run(req).await;
    }

    // Declared length over the limit is rejected outright; chunked bodies
    // are capped by the Limited wrapper and fail mid-stream
    if let Some(length) = content_length(req.headers()) {
        if length > MAX_BODY_SIZE as u64 {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    }
    let (parts, body) = req.into_parts();
    let req = Request::from_parts(parts, Body::new(Limited::new(body, MAX_BODY_SIZE)));

    if state.enable_auth {
        if let Err(reason) = authorize_external(&state, req.headers(), req.uri().path()).await {
            info!(reason = %reason, "Unauthorized external request");
            return (StatusCode::UNAUTHORIZED, reason).into_response();
        }
    }

    next.run(req).await
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Validate the bearer token and ask the policy engine for a decision
async fn authorize_external(
    state: &AppState,
    headers: &HeaderMap,
    path: &str,
) -> Result<(), String> {
    let verifier = state
        .verifier
        .as_ref()
        .ok_or_else(|| "authentication is enabled but no verifier is configured".to_string())?;

    let token = bearer_token(headers).ok_or_else(|| "missing bearer token".to_string())?;

    let mut claims = verifier.verify(token).await.map_err(|e| e.to_string())?;

    if let Some(opa) = &state.opa {
        let tunnel_id =
            extract_tunnel_id(path).ok_or_else(|| "invalid path format".to_string())?;
        let project_id = extract_project_id(tunnel_id)
            .ok_or_else(|| "invalid tunnel ID format".to_string())?;
        claims.insert(
            "project_id".to_string(),
            serde_json::Value::String(project_id),
        );

        let allowed = opa
            .check("rbac", "allow", serde_json::Value::Object(claims))
            .await
            .map_err(|e| e.to_string())?;
        if !allowed {
            return Err("access denied".to_string());
        }
    }

    Ok(())
}
