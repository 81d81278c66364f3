#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tunnelview
//!
//! Browser-facing relay for GPU sandboxes that sit behind NAT and are only
//! reachable through a reverse tunnel they opened themselves.
//!
//! ## Subcommands
//!
//! - `tunnelview serve` (default) — run the HTTP/WS server
//!
//! ## API surface
//!
//! | Method | Path                                         | Auth | Description                    |
//! |--------|----------------------------------------------|------|--------------------------------|
//! | GET    | `/api/health`                                | No   | Liveness probe                 |
//! | GET    | `/api/v1/config`                             | No   | Public relay/HLS settings      |
//! | GET    | `/api/v1/external-agents/{session}/{*path}`  | Yes  | LL-HLS playlist and media      |
//! | ANY    | `/moonlight/{*path}`                         | Yes* | HTTP/WS relay to streaming UI  |
//! | GET    | `/api/v1/moonlight/status`                   | Yes  | Streaming host status          |
//!
//! *WebSocket and HLS clients may pass the key as `?token=<key>`.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, graceful shutdown
//! auth.rs          — Bearer/?token= middleware, constant-time comparison
//! config.rs        — TOML + env-var configuration
//! credentials.rs   — backend credential (environment only)
//! directory.rs     — session → streaming host lookup
//! ratelimit.rs     — per-session WebSocket cooldown
//! tunnel/          — TunnelDialer trait, route-table dialer
//! relay/
//!   http.rs        — one HTTP exchange per dialed stream, SSE passthrough
//!   ws.rs          — backend handshake over the tunnel, three-task frame pump
//! hls/
//!   ingest.rs      — private video WebSocket → access units
//!   nal.rs         — Annex-B splitting, NAL types
//!   fmp4.rs        — init segment and fragments
//!   muxer.rs       — LL-HLS timeline, playlists, blocking reload
//!   session.rs     — per-session state, idle reaper
//! routes/          — health, public config, HLS entry point, router
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tunnelview::config::Config;
use tunnelview::credentials::CredentialProvider;
use tunnelview::directory::StaticDirectory;
use tunnelview::tunnel::RouteDialer;
use tunnelview::{routes, AppState};

/// Tunnel relay and low-latency HLS fallback for streaming sandboxes.
#[derive(Parser)]
#[command(name = "tunnelview", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tunnelview: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("tunnelview v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key, set TUNNELVIEW_API_KEY or update config");
    }

    let dialer = RouteDialer::new(config.tunnel.routes.clone());
    info!(routes = dialer.route_count(), "Tunnel route table loaded");
    let directory = StaticDirectory::new(config.sessions.clone());
    info!(sessions = directory.len(), "Session directory loaded");

    let state = AppState::new(
        config,
        Arc::new(dialer),
        Arc::new(directory),
        CredentialProvider::from_env(),
    );
    let app = routes::router(state.clone());

    let listener = match TcpListener::bind(&state.config.server.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen = %state.config.server.listen, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };

    info!("Server ready");

    let shutdown_token = CancellationToken::new();
    let reaper = state.hls.spawn_reaper(shutdown_token.child_token());

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to register SIGTERM handler");
                    ctrl_c.await.ok();
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "Server error");
    }

    // Cleanup
    info!("Shutting down...");
    shutdown_token.cancel();
    reaper.await.ok();
    state.hls.shutdown().await;
    info!("Goodbye");
}
