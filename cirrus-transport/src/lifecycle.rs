//! Connectors and the pooled-connection lifecycle.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use cirrus_core::TransportError;
use cirrus_pool::{Lifecycle, LifecycleStats};

use crate::connection::MuxConnection;
use crate::mux::StreamMultiplexer;

/// Opens byte streams to a destination.
pub trait Connector: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Send + 'static;

    fn connect(
        &self,
        destination: &str,
    ) -> impl Future<Output = Result<Self::Io, TransportError>> + Send;
}

/// Plain TCP connector. Destinations are `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    nodelay: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl TcpConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `TCP_NODELAY` on new connections.
    #[must_use]
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Connector for TcpConnector {
    type Io = TcpStream;

    async fn connect(&self, destination: &str) -> Result<TcpStream, TransportError> {
        let stream = TcpStream::connect(destination)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{destination}: {e}")))?;
        stream.set_nodelay(self.nodelay)?;
        Ok(stream)
    }
}

/// Pool lifecycle producing multiplexed connections to one destination.
pub struct ConnectionLifecycle<C> {
    connector: Arc<C>,
    destination: Arc<str>,
    mux: StreamMultiplexer,
    connects: AtomicU64,
    connect_errors: AtomicU64,
}

impl<C: Connector> ConnectionLifecycle<C> {
    pub fn new(connector: Arc<C>, destination: impl Into<Arc<str>>, mux: StreamMultiplexer) -> Self {
        Self {
            connector,
            destination: destination.into(),
            mux,
            connects: AtomicU64::new(0),
            connect_errors: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }
}

impl<C: Connector> Lifecycle for ConnectionLifecycle<C> {
    type Resource = MuxConnection;

    async fn create(&self) -> Result<MuxConnection, TransportError> {
        match self.connector.connect(&self.destination).await {
            Ok(io) => {
                self.connects.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(destination = %self.destination, "connected");
                Ok(self.mux.attach(io))
            }
            Err(e) => {
                self.connect_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(destination = %self.destination, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    fn validate_get(&self, conn: &MuxConnection) -> bool {
        conn.is_usable()
    }

    fn validate_put(&self, conn: &MuxConnection) -> bool {
        conn.is_usable()
    }

    async fn destroy(&self, conn: MuxConnection, error: bool) -> Result<(), TransportError> {
        if error && !conn.is_draining() {
            self.mux
                .on_connection_error(&conn, TransportError::ConnectionClosed);
        } else {
            self.mux.drain(&conn, self.mux.config().grace_period).await;
        }
        Ok(())
    }

    fn stats(&self) -> LifecycleStats {
        LifecycleStats {
            connects: self.connects.load(Ordering::Relaxed),
            connect_errors: self.connect_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::MuxConfig;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connector() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let lifecycle = ConnectionLifecycle::new(
            Arc::new(TcpConnector::new()),
            addr,
            StreamMultiplexer::new(MuxConfig::new()),
        );
        let (conn, accepted) = tokio::join!(lifecycle.create(), listener.accept());
        let conn = conn.unwrap();
        accepted.unwrap();

        assert!(lifecycle.validate_get(&conn));
        assert_eq!(lifecycle.stats().connects, 1);

        lifecycle.destroy(conn.clone(), false).await.unwrap();
        assert!(conn.is_closed());
        assert!(!lifecycle.validate_put(&conn));
    }

    #[tokio::test]
    async fn test_connect_failure_counted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let lifecycle = ConnectionLifecycle::new(
            Arc::new(TcpConnector::new().nodelay(false)),
            addr,
            StreamMultiplexer::new(MuxConfig::new()),
        );
        let err = lifecycle.create().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert_eq!(lifecycle.stats().connect_errors, 1);
    }
}
