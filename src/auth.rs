//! Pre-shared API key authentication.
//!
//! Every endpoint except `/api/health` and `/api/v1/config` requires either an
//! `Authorization: Bearer <key>` header or a `?token=<key>` query parameter.
//! The query form exists because browsers cannot set headers on WebSocket
//! upgrades and HLS players cannot set them on segment fetches.

use axum::{
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ProxyError;

/// Axum middleware that rejects requests without a valid key. The expected key
/// is injected via the [`ApiKey`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized`: no key supplied, or a malformed header
/// - `403 Forbidden`: key present but invalid
/// - `500 Internal Server Error`: [`ApiKey`] extension not found
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(api_key) = request.extensions().get::<ApiKey>().map(|k| k.0.clone()) else {
        return ProxyError::Internal("Server configuration error".into()).into_response();
    };

    let provided = match provided_key(&request) {
        Ok(key) => key,
        Err(err) => return err.into_response(),
    };

    if !constant_time_eq(api_key.as_bytes(), provided.as_bytes()) {
        return ProxyError::AuthorizationDenied("Invalid API key".into()).into_response();
    }

    next.run(request).await
}

/// Header takes precedence over the query parameter.
fn provided_key(request: &Request) -> Result<String, ProxyError> {
    if let Some(header) = request.headers().get("authorization") {
        return header
            .to_str()
            .ok()
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::to_string)
            .ok_or_else(|| {
                ProxyError::AuthenticationRequired("Malformed Authorization header".into())
            });
    }

    query_token(request.uri().query())
        .map(str::to_string)
        .ok_or_else(|| ProxyError::AuthenticationRequired("Missing API key".into()))
}

/// Raw `token` value from a query string, if present and non-empty.
pub fn query_token(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "token")
        .map(|(_, v)| v)
        .filter(|v| !v.is_empty())
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Extension type carrying the expected API key, injected into the router
/// layer so [`require_api_key`] can access it without touching `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);
