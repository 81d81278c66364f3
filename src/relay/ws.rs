//! WebSocket relay to the streaming UI.
//!
//! The tunnel is dialed and the backend handshake completed before the client
//! upgrade is accepted, so an unreachable sandbox is reported as an HTTP error
//! instead of a socket that closes immediately.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
    http::Uri,
    response::Response,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_tungstenite::{
    client_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message as TungsteniteMessage},
    WebSocketStream,
};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::credentials::CredentialProvider;
use crate::error::ProxyError;
use crate::state::AppState;
use crate::tunnel::TunnelStream;

use super::backend_target;

/// Host name the streaming UI expects on its WebSocket endpoint.
const BACKEND_HOST: &str = "moonlight-web";

/// Replace `AuthenticateAndInit.credentials` in a client message.
///
/// Returns `None` when the message is not JSON or carries no
/// `AuthenticateAndInit` object; the caller forwards it unchanged.
pub fn substitute_credentials(text: &str, credentials: &str) -> Option<String> {
    let mut message: Value = serde_json::from_str(text).ok()?;
    let init = message.get_mut("AuthenticateAndInit")?.as_object_mut()?;
    init.insert("credentials".into(), Value::String(credentials.to_string()));
    serde_json::to_string(&message).ok()
}

/// Dial `runner_id`, open the backend WebSocket over that stream and hand the
/// client upgrade to the frame pump.
pub async fn relay(
    state: &AppState,
    runner_id: &str,
    upgrade: WebSocketUpgrade,
    uri: &Uri,
) -> Result<Response, ProxyError> {
    let stream = super::http::dial(state, runner_id).await?;

    let url = format!("ws://{BACKEND_HOST}{}", backend_target(uri));
    let mut request = url
        .into_client_request()
        .map_err(|e| ProxyError::BadRequest(format!("Invalid WebSocket target: {e}")))?;
    let bearer = HeaderValue::from_str(&state.credentials.bearer())
        .map_err(|_| ProxyError::Internal("Backend credential is not a valid header value".into()))?;
    request.headers_mut().insert("authorization", bearer);

    let (backend, _) = client_async(request, stream).await.map_err(|e| {
        warn!(runner_id, error = %e, "Streaming UI WebSocket handshake failed");
        ProxyError::UpstreamUnavailable(format!("Streaming UI refused the WebSocket: {e}"))
    })?;

    let credentials = state.credentials.clone();
    let keepalive = state.config.relay.keepalive_interval();
    let span = info_span!("moonlight_ws", runner_id, conn_id = %Uuid::new_v4());
    Ok(upgrade.on_upgrade(move |client| {
        pump(client, backend, credentials, keepalive).instrument(span)
    }))
}

/// Run keepalive and both directions until one of them stops, then tear
/// everything down.
async fn pump(
    client: WebSocket,
    backend: WebSocketStream<TunnelStream>,
    credentials: CredentialProvider,
    keepalive: Duration,
) {
    info!("Streaming WebSocket relay established");

    let (client_tx, mut client_rx) = client.split();
    let (backend_tx, mut backend_rx) = backend.split();
    let client_tx = Arc::new(Mutex::new(client_tx));
    let backend_tx = Arc::new(Mutex::new(backend_tx));

    let mut tasks = JoinSet::new();

    let ping_tx = Arc::clone(&client_tx);
    tasks.spawn(
        async move {
            let mut ticker = tokio::time::interval(keepalive);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let sent = ping_tx.lock().await.send(AxumMessage::Ping(Bytes::new())).await;
                if let Err(e) = sent {
                    debug!(error = %e, "Keepalive ping failed");
                    return "keepalive";
                }
            }
        }
        .in_current_span(),
    );

    let to_backend = Arc::clone(&backend_tx);
    tasks.spawn(
        async move {
            let mut first_text = true;
            while let Some(Ok(msg)) = client_rx.next().await {
                let forward = match msg {
                    AxumMessage::Text(text) => {
                        let text = if std::mem::take(&mut first_text) {
                            substitute_credentials(text.as_str(), credentials.secret())
                                .unwrap_or_else(|| text.to_string())
                        } else {
                            text.to_string()
                        };
                        TungsteniteMessage::Text(text.into())
                    }
                    AxumMessage::Binary(data) => TungsteniteMessage::Binary(data),
                    AxumMessage::Close(_) => break,
                    AxumMessage::Ping(_) | AxumMessage::Pong(_) => continue,
                };
                if let Err(e) = to_backend.lock().await.send(forward).await {
                    debug!(error = %e, "Send to streaming UI failed");
                    break;
                }
            }
            "client"
        }
        .in_current_span(),
    );

    let to_client = Arc::clone(&client_tx);
    tasks.spawn(
        async move {
            while let Some(Ok(msg)) = backend_rx.next().await {
                let forward = match msg {
                    TungsteniteMessage::Text(text) => AxumMessage::Text(text.to_string().into()),
                    TungsteniteMessage::Binary(data) => AxumMessage::Binary(data),
                    TungsteniteMessage::Close(_) => break,
                    TungsteniteMessage::Ping(_)
                    | TungsteniteMessage::Pong(_)
                    | TungsteniteMessage::Frame(_) => continue,
                };
                if let Err(e) = to_client.lock().await.send(forward).await {
                    debug!(error = %e, "Send to client failed");
                    break;
                }
            }
            "backend"
        }
        .in_current_span(),
    );

    if let Some(Ok(side)) = tasks.join_next().await {
        debug!(side, "Relay direction finished");
    }
    tasks.shutdown().await;

    let _ = client_tx.lock().await.close().await;
    let _ = backend_tx.lock().await.close().await;
    info!("Streaming WebSocket relay closed");
}
