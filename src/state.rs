//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::credentials::CredentialProvider;
use crate::directory::SessionDirectory;
use crate::hls::HlsSessionManager;
use crate::ratelimit::RateLimiter;
use crate::tunnel::TunnelDialer;

/// Shared application state for the tunnelview server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Resolves logical runner IDs to tunnel streams.
    pub dialer: Arc<dyn TunnelDialer>,
    /// Backend credential substituted into relayed traffic.
    pub credentials: CredentialProvider,
    /// Per-session cooldown on streaming WebSocket connects.
    pub rate_limiter: Arc<RateLimiter>,
    /// Per-session LL-HLS state and ingest workers.
    pub hls: HlsSessionManager,
    /// Session ID to streaming-host lookup.
    pub directory: Arc<dyn SessionDirectory>,
}

impl AppState {
    pub fn new(
        config: Config,
        dialer: Arc<dyn TunnelDialer>,
        directory: Arc<dyn SessionDirectory>,
        credentials: CredentialProvider,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.relay.connection_cooldown()));
        let hls = HlsSessionManager::new(config.hls.clone(), Arc::clone(&dialer));
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            dialer,
            credentials,
            rate_limiter,
            hls,
            directory,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::AppState;
    use crate::config::Config;
    use crate::credentials::CredentialProvider;
    use crate::directory::StaticDirectory;
    use crate::tunnel::TunnelDialer;

    pub const TEST_API_KEY: &str = "test-key";
    pub const TEST_CREDENTIALS: &str = "backend-secret";

    /// State over the given dialer with `sessions` as `(session_id, instance_id)`.
    pub fn state_with(dialer: Arc<dyn TunnelDialer>, sessions: &[(&str, &str)]) -> AppState {
        let mut config = Config::default();
        config.auth.api_key = TEST_API_KEY.to_string();
        config.relay.dial_timeout_secs = 2;
        config.hls.dial_timeout_secs = 2;
        config.hls.reconnect_delay_ms = 50;
        config.hls.ready_timeout_ms = 300;
        let sessions: HashMap<String, String> = sessions
            .iter()
            .map(|(s, i)| ((*s).to_string(), (*i).to_string()))
            .collect();
        AppState::new(
            config,
            dialer,
            Arc::new(StaticDirectory::new(sessions)),
            CredentialProvider::new(TEST_CREDENTIALS),
        )
    }
}
