//! Transport seam for port forwarding.
//!
//! A [`PortForwarder`] knows how to reach a remote port through some
//! upgraded, multiplexed transport. The tunnel only relies on two steps:
//! building the upgrade endpoint (synchronous, so that malformed
//! configuration fails at construction) and dialing it (asynchronous).
//! A successful dial yields a [`ForwardSession`] that opens one logical
//! stream per forwarded local connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::error::{Result, TunnelError};
use crate::target::PodTarget;
use crate::tunnel::FaultReporter;

/// Byte stream to the remote port.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Boxed stream handed out by a [`ForwardSession`].
pub type BoxedStream = Box<dyn TunnelStream>;

/// Opens upgraded port-forward sessions to a remote target.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    /// Build the upgrade endpoint for `target` and `remote_port`.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Endpoint` when the endpoint cannot be built.
    fn endpoint(&self, target: &PodTarget, remote_port: u16) -> Result<Url>;

    /// Perform the upgrade handshake against `endpoint`.
    ///
    /// The session keeps `faults` to fail the whole tunnel when its
    /// transport breaks while a forwarded connection is using it.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Dial` when the connection or upgrade fails.
    async fn dial(&self, endpoint: &Url, faults: FaultReporter) -> Result<Box<dyn ForwardSession>>;
}

/// An established port-forward session.
#[async_trait]
pub trait ForwardSession: Send {
    /// Open one logical stream pair to the remote port.
    ///
    /// # Errors
    ///
    /// Any error is treated as a transport failure and ends the tunnel.
    async fn open_stream(&mut self) -> Result<BoxedStream>;
}

/// Forwards to a socket address that is directly reachable.
///
/// Useful when running next to the target (for example inside the
/// cluster network) and as a loopback transport in tests.
#[derive(Debug, Clone)]
pub struct DirectForwarder {
    address: SocketAddr,
    streams_opened: Arc<AtomicUsize>,
}

impl DirectForwarder {
    /// Create a forwarder that connects every stream to `address`.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            streams_opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of streams opened through this forwarder so far.
    pub fn streams_opened(&self) -> usize {
        self.streams_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortForwarder for DirectForwarder {
    fn endpoint(&self, _target: &PodTarget, _remote_port: u16) -> Result<Url> {
        Url::parse(&format!("tcp://{}", self.address))
            .map_err(|e| TunnelError::endpoint(e.to_string()))
    }

    async fn dial(&self, endpoint: &Url, _faults: FaultReporter) -> Result<Box<dyn ForwardSession>> {
        debug!(%endpoint, "Direct forwarder ready");
        Ok(Box::new(DirectSession {
            address: self.address,
            streams_opened: Arc::clone(&self.streams_opened),
        }))
    }
}

struct DirectSession {
    address: SocketAddr,
    streams_opened: Arc<AtomicUsize>,
}

#[async_trait]
impl ForwardSession for DirectSession {
    async fn open_stream(&mut self) -> Result<BoxedStream> {
        let stream = TcpStream::connect(self.address)
            .await
            .map_err(|e| TunnelError::stream(format!("connect {}: {e}", self.address)))?;
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_direct_session_counts_streams() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"pong").await;
            }
        });

        let forwarder = DirectForwarder::new(address);
        let target = PodTarget::new("ns", "pod-1")?;
        let endpoint = forwarder.endpoint(&target, 8008)?;
        let mut session = forwarder.dial(&endpoint, FaultReporter::detached()).await?;
        assert_eq!(forwarder.streams_opened(), 0);

        let mut stream = session.open_stream().await?;
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"pong");
        assert_eq!(forwarder.streams_opened(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_direct_session_reports_unreachable_address() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        drop(listener);

        let forwarder = DirectForwarder::new(address);
        let endpoint = forwarder.endpoint(&PodTarget::new("ns", "pod-1")?, 8008)?;
        let mut session = forwarder.dial(&endpoint, FaultReporter::detached()).await?;

        let result = session.open_stream().await;
        assert!(matches!(result, Err(TunnelError::Stream { .. })));
        assert_eq!(forwarder.streams_opened(), 0);
        Ok(())
    }
}
