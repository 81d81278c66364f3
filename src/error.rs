//! Error taxonomy for the public HTTP surface.
//!
//! Every failure on a request path ends up as a [`ProxyError`], which renders
//! as a JSON body `{"error": "...", "code": "..."}` with the matching status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::tunnel::DialError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    AuthenticationRequired(String),
    #[error("{0}")]
    AuthorizationDenied(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    UpstreamUnavailable(String),
    #[error("{0}")]
    NotReady(String),
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthenticationRequired(_) => StatusCode::UNAUTHORIZED,
            Self::AuthorizationDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable(_) | Self::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code included in the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthenticationRequired(_) => "AUTHENTICATION_REQUIRED",
            Self::AuthorizationDenied(_) => "AUTHORIZATION_DENIED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            Self::NotReady(_) => "NOT_READY",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Dial failure towards the streaming sandbox.
    pub fn sandbox_unreachable(err: &DialError) -> Self {
        Self::UpstreamUnavailable(format!(
            "Streaming sandbox is not running or unreachable ({err})"
        ))
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({"error": self.to_string(), "code": self.code()});
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ProxyError::AuthenticationRequired(String::new()), 401),
            (ProxyError::AuthorizationDenied(String::new()), 403),
            (ProxyError::NotFound(String::new()), 404),
            (ProxyError::BadRequest(String::new()), 400),
            (ProxyError::RateLimited(String::new()), 429),
            (ProxyError::UpstreamUnavailable(String::new()), 503),
            (ProxyError::NotReady(String::new()), 503),
            (ProxyError::Internal(String::new()), 500),
        ];
        for (err, status) in cases {
            assert_eq!(err.status().as_u16(), status, "{}", err.code());
        }
    }

    #[test]
    fn test_sandbox_unreachable_mentions_running() {
        let err = ProxyError::sandbox_unreachable(&DialError::NotRegistered("moonlight-x".into()));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.to_string().contains("not running"));
    }
}
