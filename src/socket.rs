use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::trace;

/// One direction-agnostic datagram pairing to a single neighbour.
///
/// This is an abstraction over a connected UDP socket, introduced to
/// facilitate mocking the I/O part away for testing (and to let tests wrap a
/// real socket with fault injection).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send(&self, datagram: &[u8]) -> std::io::Result<()>;

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send(&self, datagram: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending {} byte datagram", datagram.len());
        UdpSocket::send(self, datagram).await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }
}
