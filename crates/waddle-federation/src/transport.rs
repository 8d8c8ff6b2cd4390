//! Transports handed to S2S streams.
//!
//! Accepted and dialled sockets are wrapped by a [`TransportFactory`] before a
//! stream takes ownership of them. The default factory applies the
//! configured TCP keep-alive setting.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

/// Byte stream a transport can carry.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A connected byte stream plus the peer it talks to.
pub struct Transport {
    inner: Box<dyn AsyncStream>,
    peer_addr: Option<SocketAddr>,
}

impl Transport {
    /// Wrap any async byte stream.
    pub fn new(inner: impl AsyncStream, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            inner: Box::new(inner),
            peer_addr,
        }
    }

    /// Remote address, if the transport runs over a socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Take the underlying byte stream.
    pub fn into_inner(self) -> Box<dyn AsyncStream> {
        self.inner
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

/// Wraps raw sockets into transports.
pub trait TransportFactory: Send + Sync + 'static {
    /// Configure `stream` and wrap it.
    fn wrap(&self, stream: TcpStream, peer_addr: SocketAddr) -> io::Result<Transport>;
}

/// Default transport factory: TCP_NODELAY plus optional SO_KEEPALIVE.
#[derive(Debug, Clone)]
pub struct SocketTransportFactory {
    keep_alive: bool,
    keep_alive_time: Option<Duration>,
}

impl SocketTransportFactory {
    /// Create a factory; `keep_alive` toggles SO_KEEPALIVE.
    pub fn new(keep_alive: bool) -> Self {
        Self {
            keep_alive,
            keep_alive_time: None,
        }
    }

    /// Idle time before the first keep-alive probe.
    pub fn with_keep_alive_time(mut self, time: Duration) -> Self {
        self.keep_alive_time = Some(time);
        self
    }

    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;

        let sock = SockRef::from(stream);
        match (self.keep_alive, self.keep_alive_time) {
            (true, Some(time)) => sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(time))?,
            (keep_alive, _) => sock.set_keepalive(keep_alive)?,
        }
        Ok(())
    }
}

impl TransportFactory for SocketTransportFactory {
    fn wrap(&self, stream: TcpStream, peer_addr: SocketAddr) -> io::Result<Transport> {
        self.configure(&stream)?;
        debug!(peer = %peer_addr, keep_alive = self.keep_alive, "Socket transport configured");
        Ok(Transport::new(stream, Some(peer_addr)))
    }
}
