//! Connection wrapper permitting non-destructive prefix inspection.
//!
//! `PeekStream` owns an append-only accumulator of bytes that have been read
//! from the underlying stream but not yet delivered to the caller. Repeated
//! peeks at non-decreasing sizes return progressively longer prefixes of the
//! same stream; once the caller switches to regular reads, buffered bytes are
//! drained first, then fresh bytes. No byte is delivered twice or lost.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// How much to ask the underlying stream for in one peek-driven read.
const PEEK_READ_CHUNK: usize = 4096;

/// A duplex stream with a lookahead buffer.
pub struct PeekStream<S> {
    inner: S,
    /// Bytes read from `inner` but not yet delivered. Only ever appended to;
    /// `pos` tracks how much of it regular reads have consumed.
    buffer: Vec<u8>,
    pos: usize,
}

impl<S> PeekStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            pos: 0,
        }
    }

    /// Number of buffered bytes not yet delivered by `read`.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// Unwrap into the underlying stream plus any residual buffered bytes.
    ///
    /// The residual bytes logically precede whatever the stream yields next.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        let residual = self.buffer[self.pos..].to_vec();
        (self.inner, residual)
    }
}

impl<S: AsyncRead + Unpin> PeekStream<S> {
    /// Return up to the first `n` undelivered bytes without consuming them.
    ///
    /// When `n` bytes are already buffered this is a pure in-memory copy.
    /// Otherwise a single read against the underlying stream is performed
    /// (single-shot), so the returned prefix may be shorter than `n`; callers
    /// that need more retry with their own deadline policy.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        if self.buffered() < n {
            let mut chunk = [0u8; PEEK_READ_CHUNK];
            let want = (n - self.buffered()).max(1).min(PEEK_READ_CHUNK);
            let read = self.inner.read(&mut chunk[..want]).await?;
            self.buffer.extend_from_slice(&chunk[..read]);
        }
        let end = self.pos + self.buffered().min(n);
        Ok(&self.buffer[self.pos..end])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.pos < me.buffer.len() {
            let n = (me.buffer.len() - me.pos).min(buf.remaining());
            buf.put_slice(&me.buffer[me.pos..me.pos + n]);
            me.pos += n;
            if me.pos == me.buffer.len() {
                me.buffer.clear();
                me.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn peek_returns_prefix_without_consuming() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"hello world").await.unwrap();

        let mut peeked = PeekStream::new(server);
        let prefix = peeked.peek(5).await.unwrap();
        assert_eq!(prefix, b"hello");

        let mut out = vec![0u8; 11];
        peeked.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[tokio::test]
    async fn growing_peeks_agree_on_common_prefix() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"abcdefgh").await.unwrap();

        let mut peeked = PeekStream::new(server);
        let small = peeked.peek(3).await.unwrap().to_vec();
        let large = peeked.peek(8).await.unwrap().to_vec();
        assert_eq!(small, b"abc");
        assert_eq!(&large[..3], b"abc");
        assert_eq!(large, b"abcdefgh");
    }

    #[tokio::test]
    async fn shrinking_peek_is_a_pure_copy() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"abcdefgh").await.unwrap();

        let mut peeked = PeekStream::new(server);
        assert_eq!(peeked.peek(8).await.unwrap(), b"abcdefgh");
        // Nothing further is written; a smaller peek must still succeed.
        assert_eq!(peeked.peek(2).await.unwrap(), b"ab");
    }

    #[tokio::test]
    async fn peek_is_single_shot_on_short_data() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"abc").await.unwrap();

        let mut peeked = PeekStream::new(server);
        // Only three bytes available: a larger peek returns them instead of
        // waiting for the rest.
        let prefix = peeked.peek(8).await.unwrap();
        assert_eq!(prefix, b"abc");
    }

    #[tokio::test]
    async fn read_interleaves_buffered_and_fresh_bytes() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"abcd").await.unwrap();

        let mut peeked = PeekStream::new(server);
        peeked.peek(4).await.unwrap();

        let mut first = [0u8; 2];
        peeked.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"ab");

        client.write_all(b"ef").await.unwrap();
        let mut rest = [0u8; 4];
        peeked.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"cdef");
    }

    #[tokio::test]
    async fn into_parts_yields_residual_bytes() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"abcdef").await.unwrap();

        let mut peeked = PeekStream::new(server);
        peeked.peek(6).await.unwrap();
        let mut first = [0u8; 2];
        peeked.read_exact(&mut first).await.unwrap();

        let (_inner, residual) = peeked.into_parts();
        assert_eq!(residual, b"cdef");
    }
}
