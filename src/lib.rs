#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! tunnelview library — relay and LL-HLS fallback for NAT-bound streaming
//! sandboxes.
//!
//! Building blocks:
//! - `tunnel` — dialing logical peers over the reverse tunnel
//! - `relay` — HTTP/WebSocket relay to the streaming UI with credential substitution
//! - `hls` — per-session H.264 ingest and fMP4 LL-HLS muxing
//! - `auth` — API key authentication middleware
//! - `config` — configuration loading
//! - `routes` — REST route handlers and the router

pub mod auth;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod error;
pub mod hls;
pub mod ratelimit;
pub mod relay;
pub mod routes;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use credentials::CredentialProvider;
pub use error::ProxyError;
pub use hls::HlsSessionManager;
pub use state::AppState;
