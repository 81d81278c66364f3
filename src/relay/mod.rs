//! Relay to the interactive streaming UI ("moonlight") behind the tunnel.
//!
//! ```text
//! browser ──HTTP/WS──► /moonlight/{*path} ──dial moonlight-{instance}──► streaming UI
//! ```
//!
//! The end user's token stops here: every relayed request and the first
//! client WebSocket message carry the backend credential instead.

pub mod http;
pub mod ws;

use std::collections::HashMap;

use axum::{
    extract::{FromRequestParts, Query, Request, State},
    http::{header, HeaderMap},
    response::Response,
};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::state::AppState;
use crate::tunnel::moonlight_runner_id;

/// Reduce a streaming-client session parameter to the plain session ID.
///
/// The client prefixes the session with `agent-` and may append a `-suffix`
/// (`agent-ses_abc-lobby`). Only `ses_` and `req_` IDs are recognised;
/// anything else means "no session".
pub fn extract_session_id(raw: &str) -> Option<String> {
    let trimmed = raw.strip_prefix("agent-").unwrap_or(raw);
    if !(trimmed.starts_with("ses_") || trimmed.starts_with("req_")) {
        return None;
    }
    let id = trimmed.split('-').next().unwrap_or(trimmed);
    Some(id.to_string())
}

/// Map a public `/moonlight/...` path onto the streaming UI's API: strip the
/// prefix (empty becomes `/`), then prefix `/api` unless already there.
pub fn rewrite_path(path: &str) -> String {
    let stripped = match path.strip_prefix("/moonlight").unwrap_or(path) {
        "" => "/",
        rest => rest,
    };
    if stripped.starts_with("/api/") {
        stripped.to_string()
    } else {
        format!("/api{stripped}")
    }
}

/// Rewritten path plus the query string, minus the caller's own `token`.
pub(crate) fn backend_target(uri: &axum::http::Uri) -> String {
    let path = rewrite_path(uri.path());
    let query: Vec<&str> = uri
        .query()
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty() && *pair != "token" && !pair.starts_with("token="))
        .collect();
    if query.is_empty() {
        path
    } else {
        format!("{path}?{}", query.join("&"))
    }
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Runner ID serving `session_id`, or the fallback when there is no session.
async fn resolve_runner(state: &AppState, session_id: Option<&str>) -> Result<String, ProxyError> {
    let Some(session_id) = session_id else {
        return Ok(state.config.relay.fallback_runner_id.clone());
    };

    let record = state
        .directory
        .lookup(session_id)
        .await
        .ok_or_else(|| ProxyError::NotFound("Session not found".into()))?;

    Ok(match record.instance_id {
        Some(instance) => moonlight_runner_id(&instance),
        None => {
            debug!(session_id, "Session has no streaming instance, using fallback");
            state.config.relay.fallback_runner_id.clone()
        }
    })
}

/// `ANY /moonlight/{*path}` — HTTP or WebSocket relay to the streaming UI.
///
/// WebSocket upgrades carrying a session are rate limited before anything is
/// dialed.
pub async fn moonlight_proxy(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> Result<Response, ProxyError> {
    let session_id = query
        .get("session_id")
        .map(String::as_str)
        .and_then(extract_session_id);
    let runner_id = resolve_runner(&state, session_id.as_deref()).await?;

    if !is_websocket_upgrade(request.headers()) {
        return http::forward(&state, &runner_id, request).await;
    }

    if let Some(session_id) = session_id.as_deref() {
        if !state.rate_limiter.allow(session_id) {
            warn!(session_id, "Streaming WebSocket rejected within cooldown");
            return Err(ProxyError::RateLimited(
                "Too many connection attempts, retry shortly".into(),
            ));
        }
    }

    let (mut parts, _body) = request.into_parts();
    let upgrade = axum::extract::ws::WebSocketUpgrade::from_request_parts(&mut parts, &state)
        .await
        .map_err(|rejection| ProxyError::BadRequest(rejection.body_text()))?;
    ws::relay(&state, &runner_id, upgrade, &parts.uri).await
}

/// `GET /api/v1/moonlight/status?wolf_instance_id=` — status of one
/// streaming host.
pub async fn moonlight_status(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ProxyError> {
    let instance_id = query
        .get("wolf_instance_id")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProxyError::BadRequest("wolf_instance_id is required".into()))?;
    http::fetch_status(&state, &moonlight_runner_id(instance_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_session_id() {
        assert_eq!(extract_session_id("agent-ses_abc").as_deref(), Some("ses_abc"));
        assert_eq!(
            extract_session_id("agent-ses_abc-lobby-2").as_deref(),
            Some("ses_abc")
        );
        assert_eq!(extract_session_id("req_42-x").as_deref(), Some("req_42"));
        assert_eq!(extract_session_id("agent-other"), None);
        assert_eq!(extract_session_id(""), None);
    }

    #[test]
    fn test_rewrite_path() {
        assert_eq!(rewrite_path("/moonlight"), "/api/");
        assert_eq!(rewrite_path("/moonlight/"), "/api/");
        assert_eq!(rewrite_path("/moonlight/api/hosts"), "/api/hosts");
        assert_eq!(rewrite_path("/moonlight/hosts"), "/api/hosts");
        assert_eq!(rewrite_path("/moonlight/apiary"), "/api/apiary");
        assert_eq!(rewrite_path("/api/hosts"), "/api/hosts");
    }

    #[test]
    fn test_backend_target_keeps_query() {
        let uri: axum::http::Uri = "/moonlight/host/stream?session_id=agent-ses_1&x=2"
            .parse()
            .unwrap();
        assert_eq!(
            backend_target(&uri),
            "/api/host/stream?session_id=agent-ses_1&x=2"
        );
    }

    #[test]
    fn test_backend_target_drops_caller_token() {
        let uri: axum::http::Uri = "/moonlight/api/host/stream?token=secret&session_id=agent-ses_1"
            .parse()
            .unwrap();
        assert_eq!(backend_target(&uri), "/api/host/stream?session_id=agent-ses_1");

        let uri: axum::http::Uri = "/moonlight/hosts?token=secret".parse().unwrap();
        assert_eq!(backend_target(&uri), "/api/hosts");
    }

    #[test]
    fn test_is_websocket_upgrade() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));
        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));
    }
}
