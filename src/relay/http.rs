//! One HTTP exchange over a dialed tunnel stream.
//!
//! Each request gets its own stream and its own HTTP/1.1 connection; the
//! connection task ends when the response body has been consumed or dropped.

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderValue, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::TryStreamExt;
use http_body_util::{BodyExt, BodyStream, Empty};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::state::AppState;
use crate::tunnel::{dial_with_timeout, TunnelStream};

use super::backend_target;

const STATUS_PATH: &str = "/api/admin/status";

/// Connection-scoped headers that must not be copied from the upstream.
const HOP_BY_HOP: [header::HeaderName; 4] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHENTICATE,
];

/// Relay `request` to `runner_id` with the path rewritten and the backend
/// credential in place of whatever the client sent.
pub async fn forward(
    state: &AppState,
    runner_id: &str,
    request: Request,
) -> Result<Response, ProxyError> {
    let stream = dial(state, runner_id).await?;

    let (mut parts, body) = request.into_parts();
    let target = backend_target(&parts.uri);
    parts.uri = target
        .parse::<Uri>()
        .map_err(|e| ProxyError::BadRequest(format!("Invalid request path: {e}")))?;
    parts
        .headers
        .insert(header::AUTHORIZATION, bearer_header(state)?);
    if !parts.headers.contains_key(header::HOST) {
        parts
            .headers
            .insert(header::HOST, HeaderValue::from_static("localhost"));
    }

    debug!(runner_id, path = %target, method = %parts.method, "Relaying HTTP request");
    let response = send(stream, Request::from_parts(parts, body), runner_id).await?;
    Ok(into_client_response(response, state.config.relay.sse_buffer_bytes))
}

/// `GET /api/admin/status` on the streaming UI behind `runner_id`, returned
/// as JSON with the upstream status code.
pub async fn fetch_status(state: &AppState, runner_id: &str) -> Result<Response, ProxyError> {
    let stream = dial(state, runner_id).await?;

    let request = axum::http::Request::get(STATUS_PATH)
        .header(header::HOST, "localhost")
        .header(header::AUTHORIZATION, bearer_header(state)?)
        .body(Empty::<Bytes>::new())
        .map_err(|e| ProxyError::Internal(format!("Failed to build status request: {e}")))?;

    let response = send(stream, request, runner_id).await?;
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| ProxyError::Internal(format!("Failed to read status response: {e}")))?
        .to_bytes();

    Ok((
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body,
    )
        .into_response())
}

pub(super) async fn dial(state: &AppState, runner_id: &str) -> Result<TunnelStream, ProxyError> {
    dial_with_timeout(
        state.dialer.as_ref(),
        runner_id,
        state.config.relay.dial_timeout(),
    )
    .await
    .map_err(|e| {
        warn!(runner_id, error = %e, "Failed to dial streaming UI");
        ProxyError::sandbox_unreachable(&e)
    })
}

fn bearer_header(state: &AppState) -> Result<HeaderValue, ProxyError> {
    HeaderValue::from_str(&state.credentials.bearer())
        .map_err(|_| ProxyError::Internal("Backend credential is not a valid header value".into()))
}

/// Run one HTTP/1.1 exchange over `stream`.
async fn send<B>(
    stream: TunnelStream,
    request: axum::http::Request<B>,
    runner_id: &str,
) -> Result<axum::http::Response<Incoming>, ProxyError>
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::Internal(format!("HTTP handshake over tunnel failed: {e}")))?;

    let conn_runner = runner_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(runner_id = %conn_runner, error = %e, "Tunnel HTTP connection ended with error");
        }
    });

    sender.send_request(request).await.map_err(|e| {
        warn!(runner_id, error = %e, "Relayed HTTP request failed");
        ProxyError::Internal(format!("Failed to relay request: {e}"))
    })
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

/// Copy status and headers and stream the body through. SSE bodies are
/// re-chunked so each read is flushed to the client as it arrives.
fn into_client_response(
    response: axum::http::Response<Incoming>,
    sse_buffer_bytes: usize,
) -> Response {
    let (mut parts, body) = response.into_parts();
    for name in &HOP_BY_HOP {
        parts.headers.remove(name);
    }

    let body = if is_event_stream(&parts.headers) {
        let frames = BodyStream::new(body)
            .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) })
            .map_err(std::io::Error::other);
        let reader = StreamReader::new(frames);
        Body::from_stream(ReaderStream::with_capacity(reader, sse_buffer_bytes))
    } else {
        Body::new(body)
    };

    Response::from_parts(parts, body)
}
