//! Public LL-HLS entry point for external-agent sessions.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::Uri,
    response::Response,
};
use tracing::{debug, warn};

use crate::auth::query_token;
use crate::error::ProxyError;
use crate::hls::{HlsRequest, StreamParams};
use crate::state::AppState;

/// `GET /api/v1/external-agents/{session_id}/{*path}` — playlist, init
/// segment, segments and parts of the session's HLS feed.
///
/// The first request for a session creates it and starts ingest; requests
/// wait up to the configured ready timeout for the first keyframe.
pub async fn external_agent_hls(
    State(state): State<AppState>,
    Path((session_id, path)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    uri: Uri,
) -> Result<Response, ProxyError> {
    if state.directory.lookup(&session_id).await.is_none() {
        return Err(ProxyError::NotFound("Session not found".into()));
    }

    let request = HlsRequest {
        msn: blocking_param(&query, "_HLS_msn")?,
        part: blocking_param(&query, "_HLS_part")?,
        uri_query: query_token(uri.query()).map(|token| format!("token={token}")),
    };
    let params = StreamParams::from_query(
        query.get("width").map(String::as_str),
        query.get("height").map(String::as_str),
        query.get("bitrate").map(String::as_str),
        query.get("fps").map(String::as_str),
    );

    let session = state.hls.get_or_create(&session_id, params).await;
    let Some(muxer) = session
        .wait_started(state.hls.config().ready_timeout())
        .await
    else {
        warn!(session_id, "HLS stream not ready in time");
        return Err(ProxyError::NotReady("HLS stream not ready".into()));
    };
    session.touch();

    debug!(session_id, path, "Serving HLS resource");
    let response = muxer.handle(&path, &request).await;
    session.touch();
    Ok(response)
}

fn blocking_param(query: &HashMap<String, String>, name: &str) -> Result<Option<u64>, ProxyError> {
    query
        .get(name)
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|_| ProxyError::BadRequest(format!("Invalid {name}: {raw}")))
        })
        .transpose()
}
