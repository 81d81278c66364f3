//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] and [`config`] require authentication via the
//! [`crate::auth::require_api_key`] middleware.

pub mod config;
pub mod health;
pub mod hls;

use axum::{
    middleware,
    routing::{any, get},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::relay;
use crate::state::AppState;

/// Full application router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/health", get(health::health))
        .route("/api/v1/config", get(config::public_config));

    let authed_routes = Router::new()
        .route(
            "/api/v1/external-agents/{session_id}/{*path}",
            get(hls::external_agent_hls),
        )
        .route("/api/v1/moonlight/status", get(relay::moonlight_status))
        .route("/moonlight", any(relay::moonlight_proxy))
        .route("/moonlight/{*path}", any(relay::moonlight_proxy))
        .layer(middleware::from_fn(auth::require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::state::testing::{state_with, TEST_API_KEY, TEST_CREDENTIALS};
    use crate::tunnel::testing::{DuplexDialer, NoPeers};

    fn app() -> Router {
        router(state_with(
            Arc::new(NoPeers),
            &[("ses_known", "missing"), ("ses_unplaced", "")],
        ))
    }

    async fn call(uri: &str) -> (StatusCode, String) {
        let request = Request::get(uri)
            .header("authorization", format!("Bearer {TEST_API_KEY}"))
            .body(Body::empty())
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let request = Request::get("/api/health").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["hls_sessions"], 0);
    }

    #[tokio::test]
    async fn test_public_config_omits_credentials() {
        let request = Request::get("/api/v1/config").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains(TEST_CREDENTIALS));
        assert!(!text.contains(TEST_API_KEY));
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["relay"]["fallback_runner_id"], "moonlight-dev");
        assert_eq!(json["hls"]["segment_count"], 3);
    }

    #[tokio::test]
    async fn test_relay_requires_api_key() {
        let request = Request::get("/moonlight/api/hosts").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_relay_to_missing_sandbox_is_503() {
        let (status, body) = call("/moonlight/api/hosts?session_id=agent-ses_known-x").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("not running"), "{body}");
        assert!(body.contains("moonlight-missing"), "{body}");
    }

    #[tokio::test]
    async fn test_relay_unplaced_session_uses_fallback() {
        let (status, body) = call("/moonlight/api/hosts?session_id=agent-ses_unplaced").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("moonlight-dev"), "{body}");
    }

    #[tokio::test]
    async fn test_relay_unknown_session_is_404() {
        let (status, _) = call("/moonlight/api/hosts?session_id=agent-ses_other").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_requires_instance() {
        let (status, _) = call("/api/v1/moonlight/status").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call("/api/v1/moonlight/status?wolf_instance_id=missing").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("not running"), "{body}");
    }

    #[tokio::test]
    async fn test_hls_unknown_session_is_404() {
        let (status, _) = call("/api/v1/external-agents/ses_other/stream.m3u8").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_hls_invalid_blocking_param_is_400() {
        let (status, _) = call("/api/v1/external-agents/ses_known/stream.m3u8?_HLS_msn=soon").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_hls_without_source_is_not_ready() {
        let (status, body) = call("/api/v1/external-agents/ses_known/stream.m3u8").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("HLS stream not ready"), "{body}");
    }

    /// One frame of the private video wire format at 1080p.
    fn wire_frame(keyframe: bool, index: u64, nalus: &[&[u8]]) -> Vec<u8> {
        let mut frame = vec![0x01, 0x00, u8::from(keyframe)];
        frame.extend_from_slice(&index.to_be_bytes());
        frame.extend_from_slice(&1920u16.to_be_bytes());
        frame.extend_from_slice(&1080u16.to_be_bytes());
        for nalu in nalus {
            frame.extend_from_slice(&[0, 0, 0, 1]);
            frame.extend_from_slice(nalu);
        }
        frame
    }

    #[tokio::test]
    async fn test_hls_serves_playlist_and_segment_from_live_source() {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        const SPS: &[u8] = &[0x67, 0x42, 0xC0, 0x28, 0x8C, 0x8D];
        const PPS: &[u8] = &[0x68, 0xCE, 0x3C, 0x80];
        const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x21];
        const SLICE: &[u8] = &[0x41, 0x9A, 0x02];

        let dialer = Arc::new(DuplexDialer::new());
        let mut peers = dialer.register("desktop-ses_live");
        tokio::spawn(async move {
            while let Some(stream) = peers.recv().await {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let Some(Ok(Message::Text(init))) = ws.next().await else {
                    continue;
                };
                let init: Value = serde_json::from_str(init.as_str()).unwrap();
                assert_eq!(init["width"], 1920);
                assert_eq!(init["height"], 1080);
                assert_eq!(init["fps"], 60);
                for i in 0..150u64 {
                    let frame = if i % 30 == 0 {
                        wire_frame(true, i, &[SPS, PPS, IDR])
                    } else {
                        wire_frame(false, i, &[SLICE])
                    };
                    if ws.send(Message::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
                while ws.next().await.is_some() {}
            }
        });

        let state = state_with(dialer, &[("ses_live", "")]);
        let app = router(state.clone());
        let get = |uri: String| {
            let app = app.clone();
            async move {
                let request = Request::get(uri)
                    .header("authorization", format!("Bearer {TEST_API_KEY}"))
                    .body(Body::empty())
                    .unwrap();
                app.oneshot(request).await.unwrap()
            }
        };

        // The first request starts ingest; retry until the source has produced
        // a segment.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        let playlist = loop {
            let response = get(
                "/api/v1/external-agents/ses_live/stream.m3u8?width=1920&height=1080&fps=60"
                    .to_string(),
            )
            .await;
            if response.status() == StatusCode::OK {
                let body = response.into_body().collect().await.unwrap().to_bytes();
                break String::from_utf8(body.to_vec()).unwrap();
            }
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            assert!(tokio::time::Instant::now() < deadline, "playlist never became ready");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        };
        assert!(playlist.starts_with("#EXTM3U"), "{playlist}");
        assert!(playlist.contains("#EXT-X-MAP:URI=\"init.mp4\""), "{playlist}");

        let segment = playlist
            .lines()
            .find(|line| line.starts_with("seg") && line.ends_with(".mp4"))
            .expect("playlist lists a segment")
            .to_string();
        let response = get(format!("/api/v1/external-agents/ses_live/{segment}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "video/mp4");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(!body.is_empty());

        state.hls.shutdown().await;
    }
}
