//! Reverse-tunnel dialing.
//!
//! Sandboxes sit behind NAT and register themselves with a tunnel broker under
//! a logical runner ID (`moonlight-{instance}`, `desktop-{session}`). This
//! module only consumes that broker: [`TunnelDialer::dial`] turns a logical ID
//! into a fresh ordered byte stream. Whoever dials a stream owns it and drops
//! it when done; streams are never shared between operations.

pub mod route;

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

pub use route::RouteDialer;

/// Byte stream carried over a tunnel.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// An owned, dialed tunnel connection.
pub type TunnelStream = Box<dyn TunnelIo>;

/// Failure to reach a logical peer. Every variant means the peer is
/// unavailable right now.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("no tunnel registered for '{0}'")]
    NotRegistered(String),
    #[error("connect to '{runner_id}' failed: {source}")]
    Connect {
        runner_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dial to '{0}' timed out")]
    Timeout(String),
}

/// Resolves a logical runner ID to a live connection.
pub trait TunnelDialer: Send + Sync + 'static {
    fn dial<'a>(&'a self, runner_id: &'a str) -> BoxFuture<'a, Result<TunnelStream, DialError>>;
}

/// Dial with an optional upper bound. `None` waits as long as the dialer does.
pub async fn dial_with_timeout(
    dialer: &dyn TunnelDialer,
    runner_id: &str,
    timeout: Option<Duration>,
) -> Result<TunnelStream, DialError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, dialer.dial(runner_id))
            .await
            .map_err(|_| DialError::Timeout(runner_id.to_string()))?,
        None => dialer.dial(runner_id).await,
    }
}

/// Runner ID of a session's desktop container (video source).
pub fn desktop_runner_id(session_id: &str) -> String {
    format!("desktop-{session_id}")
}

/// Runner ID of the streaming UI on a given host instance.
pub fn moonlight_runner_id(instance_id: &str) -> String {
    format!("moonlight-{instance_id}")
}


#[cfg(test)]
mod tests {
    use super::testing::NoPeers;
    use super::*;

    #[tokio::test]
    async fn test_dial_with_timeout_passes_through_errors() {
        let err = dial_with_timeout(&NoPeers, "moonlight-missing", Some(Duration::from_secs(1)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DialError::NotRegistered(id) if id == "moonlight-missing"));
    }

    #[tokio::test]
    async fn test_dial_with_timeout_bounds_hanging_dial() {
        struct Hang;
        impl TunnelDialer for Hang {
            fn dial<'a>(
                &'a self,
                _runner_id: &'a str,
            ) -> BoxFuture<'a, Result<TunnelStream, DialError>> {
                Box::pin(futures::future::pending::<Result<TunnelStream, DialError>>())
            }
        }
        let err = dial_with_timeout(&Hang, "desktop-1", Some(Duration::from_millis(20)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DialError::Timeout(_)));
    }

    #[test]
    fn test_runner_ids() {
        assert_eq!(desktop_runner_id("ses_1"), "desktop-ses_1");
        assert_eq!(moonlight_runner_id("wolf-a"), "moonlight-wolf-a");
    }
}
