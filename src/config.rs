//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `TUNNELVIEW_API_KEY`, `TUNNELVIEW_LISTEN`,
//!    `TUNNELVIEW_FALLBACK_RUNNER_ID`
//! 2. **Config file**: path via `--config <path>`, or `tunnelview.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The backend credential is not a config field. It is read from
//! `TUNNELVIEW_BACKEND_CREDENTIALS` by [`crate::credentials`].
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [logging]
//! level = "info"
//!
//! [relay]
//! fallback_runner_id = "moonlight-dev"
//! dial_timeout_secs = 30        # 0 = wait for the tunnel indefinitely
//! keepalive_interval_secs = 15
//! connection_cooldown_ms = 3000
//! sse_buffer_bytes = 262144
//!
//! [hls]
//! segment_count = 3
//! segment_min_duration_ms = 500
//! part_min_duration_ms = 100
//! idle_timeout_secs = 300
//!
//! [tunnel.routes]
//! "moonlight-dev" = "127.0.0.1:8081"
//! "desktop-ses_01h" = "127.0.0.1:9876"
//!
//! [sessions]
//! "ses_01h" = "dev"             # session ID -> streaming host instance
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default config file looked up in the working directory.
const DEFAULT_CONFIG_FILE: &str = "tunnelview.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub hls: HlsConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Session ID to streaming-host instance ID.
    #[serde(default)]
    pub sessions: HashMap<String, String>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `TUNNELVIEW_API_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Streaming-UI relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Runner used when a relay request names no session (default `moonlight-dev`).
    #[serde(default = "default_fallback_runner_id")]
    pub fallback_runner_id: String,
    /// Upper bound on a relay dial in seconds; 0 disables the bound (default 30).
    #[serde(default = "default_relay_dial_timeout")]
    pub dial_timeout_secs: u64,
    /// Ping period towards the browser in seconds (default 15).
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    /// Minimum gap between WebSocket connections per session (default 3000 ms).
    #[serde(default = "default_connection_cooldown_ms")]
    pub connection_cooldown_ms: u64,
    /// Read buffer for server-sent event passthrough (default 256 KiB).
    #[serde(default = "default_sse_buffer_bytes")]
    pub sse_buffer_bytes: usize,
}

/// HLS fallback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlsConfig {
    /// Segments kept in the live playlist window (default 3).
    #[serde(default = "default_segment_count")]
    pub segment_count: usize,
    #[serde(default = "default_segment_min_duration_ms")]
    pub segment_min_duration_ms: u64,
    #[serde(default = "default_part_min_duration_ms")]
    pub part_min_duration_ms: u64,
    /// Sessions without a request for this long are torn down (default 300).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_hls_dial_timeout")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// How long a manifest request waits for the muxer to start (default 5000).
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Upper bound for blocking playlist and part requests (default 10000).
    #[serde(default = "default_blocking_timeout_ms")]
    pub blocking_timeout_ms: u64,
}

/// Tunnel dialing settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TunnelConfig {
    /// Logical runner ID to `host:port`.
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_fallback_runner_id() -> String {
    "moonlight-dev".to_string()
}
fn default_relay_dial_timeout() -> u64 {
    30
}
fn default_keepalive_interval() -> u64 {
    15
}
fn default_connection_cooldown_ms() -> u64 {
    3000
}
fn default_sse_buffer_bytes() -> usize {
    256 * 1024
}
fn default_segment_count() -> usize {
    3
}
fn default_segment_min_duration_ms() -> u64 {
    500
}
fn default_part_min_duration_ms() -> u64 {
    100
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_hls_dial_timeout() -> u64 {
    30
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_ready_timeout_ms() -> u64 {
    5000
}
fn default_blocking_timeout_ms() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fallback_runner_id: default_fallback_runner_id(),
            dial_timeout_secs: default_relay_dial_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            connection_cooldown_ms: default_connection_cooldown_ms(),
            sse_buffer_bytes: default_sse_buffer_bytes(),
        }
    }
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            segment_count: default_segment_count(),
            segment_min_duration_ms: default_segment_min_duration_ms(),
            part_min_duration_ms: default_part_min_duration_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            dial_timeout_secs: default_hls_dial_timeout(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            blocking_timeout_ms: default_blocking_timeout_ms(),
        }
    }
}

impl RelayConfig {
    /// `None` when the dial is unbounded.
    pub fn dial_timeout(&self) -> Option<Duration> {
        (self.dial_timeout_secs > 0).then(|| Duration::from_secs(self.dial_timeout_secs))
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn connection_cooldown(&self) -> Duration {
        Duration::from_millis(self.connection_cooldown_ms)
    }
}

impl HlsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `tunnelview.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Config::default(),
        };

        if let Ok(key) = std::env::var("TUNNELVIEW_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("TUNNELVIEW_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(runner) = std::env::var("TUNNELVIEW_FALLBACK_RUNNER_ID") {
            config.relay.fallback_runner_id = runner;
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}
