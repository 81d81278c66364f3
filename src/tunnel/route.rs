//! Route-table dialer.
//!
//! Maps logical runner IDs to TCP endpoints from `[tunnel.routes]`. Used in
//! development (peers reachable directly) and where a local tunnel agent
//! exposes one port per registered peer.

use std::collections::HashMap;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::TcpStream;
use tracing::debug;

use super::{DialError, TunnelDialer, TunnelStream};

pub struct RouteDialer {
    routes: HashMap<String, String>,
}

impl RouteDialer {
    pub fn new(routes: HashMap<String, String>) -> Self {
        Self { routes }
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

impl TunnelDialer for RouteDialer {
    fn dial<'a>(&'a self, runner_id: &'a str) -> BoxFuture<'a, Result<TunnelStream, DialError>> {
        async move {
            let addr = self
                .routes
                .get(runner_id)
                .ok_or_else(|| DialError::NotRegistered(runner_id.to_string()))?;
            debug!(runner_id, addr = %addr, "Dialing tunnel route");
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|source| DialError::Connect {
                    runner_id: runner_id.to_string(),
                    source,
                })?;
            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream) as TunnelStream)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_unknown_route_is_not_registered() {
        let dialer = RouteDialer::new(HashMap::new());
        let err = dialer.dial("moonlight-missing").await.err().unwrap();
        assert!(matches!(err, DialError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn test_dials_configured_route() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let dialer = RouteDialer::new(HashMap::from([("desktop-a".to_string(), addr)]));
        let mut stream = dialer.dial("desktop-a").await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_refused_connection_maps_to_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let dialer = RouteDialer::new(HashMap::from([("desktop-b".to_string(), addr)]));
        let err = dialer.dial("desktop-b").await.err().unwrap();
        assert!(matches!(err, DialError::Connect { .. }));
    }
}
