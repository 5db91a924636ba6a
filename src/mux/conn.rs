//! Client connection type flowing through the classifier.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::peek::PeekStream;

/// Object-safe duplex stream bound.
pub trait SessionIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionIo for T {}

/// Where a proxied connection was originally headed before it reached us.
///
/// Captured either from kernel state (`SO_ORIGINAL_DST` on transparently
/// redirected sockets) or by the CONNECT front-end before it handed the byte
/// stream back into classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginalDst {
    /// Whether the original leg was expected to speak TLS.
    pub tls: bool,
    /// `host:port` of the original destination.
    pub authority: String,
}

/// An accepted connection with lookahead and optional routing metadata.
pub struct ClientConn {
    io: PeekStream<Box<dyn SessionIo>>,
    peer_addr: Option<SocketAddr>,
    original_dst: Option<OriginalDst>,
}

impl ClientConn {
    pub fn new(
        io: Box<dyn SessionIo>,
        peer_addr: Option<SocketAddr>,
        original_dst: Option<OriginalDst>,
    ) -> Self {
        Self {
            io: PeekStream::new(io),
            peer_addr,
            original_dst,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The pre-proxy destination, when one was captured.
    pub fn original_destination(&self) -> Option<&OriginalDst> {
        self.original_dst.as_ref()
    }

    /// Inspect the next `n` undelivered bytes without consuming them.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        self.io.peek(n).await
    }

    /// Number of peeked bytes not yet drained by reads.
    pub fn buffered(&self) -> usize {
        self.io.buffered()
    }
}

impl AsyncRead for ClientConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl AsyncWrite for ClientConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("peer_addr", &self.peer_addr)
            .field("original_dst", &self.original_dst)
            .field("buffered", &self.io.buffered())
            .finish()
    }
}
