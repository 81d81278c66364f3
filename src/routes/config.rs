//! Public client configuration.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/v1/config` — relay and HLS settings clients may tune against.
///
/// Built from [`crate::config::Config`] only; the backend credential lives
/// outside it and cannot appear here.
pub async fn public_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "relay": state.config.relay,
        "hls": state.config.hls,
    }))
}
