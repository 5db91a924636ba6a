//! Ordered connection middleware and the channel-backed listeners they feed.
//!
//! Each accepted connection runs through a priority list of middleware. A
//! middleware either passes the connection onward (possibly replaced), takes
//! it (typically by sending it onto a channel another listener consumes), or
//! fails classification. Classification reads only via peek; no middleware
//! consumes bytes from the stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::conn::ClientConn;
use super::error::MuxError;

/// Outcome-bearing middleware over accepted connections.
///
/// `Ok(Some(conn))` passes the (possibly replaced) connection to the next
/// middleware; `Ok(None)` means this middleware took the connection.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, conn: ClientConn) -> Result<Option<ClientConn>, MuxError>;
}

/// Middleware that routes matched connections onward to another middleware.
///
/// Peeks through a ladder of prefix sizes; a prefix shorter than the current
/// ladder size (EOF, slow client past the deadline, or peek error) passes the
/// connection onward unclassified. Peeks are single-shot unless a deadline is
/// configured.
pub struct PatternClassifier {
    sizes: Vec<usize>,
    matches: fn(&[u8]) -> bool,
    deadline: Option<Duration>,
    on_match: Arc<dyn Middleware>,
}

impl PatternClassifier {
    pub fn new(
        sizes: Vec<usize>,
        matches: fn(&[u8]) -> bool,
        deadline: Option<Duration>,
        on_match: Arc<dyn Middleware>,
    ) -> Self {
        Self {
            sizes,
            matches,
            deadline,
            on_match,
        }
    }

    async fn available(&self, conn: &mut ClientConn, size: usize, started: Instant) -> usize {
        loop {
            let peeked = match self.deadline {
                None => conn.peek(size).await,
                Some(window) => {
                    let remaining = window.saturating_sub(started.elapsed());
                    match tokio::time::timeout(remaining, conn.peek(size)).await {
                        Ok(result) => result,
                        Err(_) => return conn.buffered(),
                    }
                }
            };
            match peeked {
                Ok(prefix) if prefix.len() >= size => return size,
                Ok(prefix) => {
                    let got = prefix.len();
                    match self.deadline {
                        Some(window) if started.elapsed() < window => continue,
                        _ => return got,
                    }
                }
                Err(e) => {
                    debug!(error = %e, "peek failed during classification");
                    return 0;
                }
            }
        }
    }
}

#[async_trait]
impl Middleware for PatternClassifier {
    async fn handle(&self, mut conn: ClientConn) -> Result<Option<ClientConn>, MuxError> {
        let started = Instant::now();
        for &size in &self.sizes {
            if self.available(&mut conn, size, started).await < size {
                return Ok(Some(conn));
            }
            let matched = {
                let prefix = conn.peek(size).await?;
                (self.matches)(&prefix[..size])
            };
            if matched {
                return self.on_match.handle(conn).await;
            }
        }
        Ok(Some(conn))
    }
}

/// Terminal middleware sending every connection it sees onto a channel.
pub struct ChannelSink {
    tx: mpsc::Sender<ClientConn>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ClientConn>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Middleware for ChannelSink {
    async fn handle(&self, conn: ClientConn) -> Result<Option<ClientConn>, MuxError> {
        self.tx.send(conn).await.map_err(|_| MuxError::Closed)?;
        Ok(None)
    }
}

/// TLS record-layer prefix: handshake byte plus a TLS 1.0–1.3 version.
pub fn is_tls_client_hello(prefix: &[u8]) -> bool {
    prefix.len() >= 3 && prefix[0] == 0x16 && prefix[1] == 0x03 && prefix[2] <= 0x04
}

const METHOD_TOKENS: &[&[u8]] = &[
    b"CONNECT ",
    b"DELETE ",
    b"GET ",
    b"HEAD ",
    b"OPTIONS ",
    b"PATCH ",
    b"POST ",
    b"PUT ",
    b"TRACE ",
];

/// Leading HTTP method token followed by a space.
pub fn starts_with_http_method(prefix: &[u8]) -> bool {
    METHOD_TOKENS
        .iter()
        .any(|token| prefix.len() >= token.len() && &prefix[..token.len()] == *token)
}

/// One half of a classified stream, consumed like a listener.
///
/// Both halves produced by a split share one shutdown signal, so closing
/// either closes the underlying socket exactly once.
pub struct ChannelListener {
    conns: mpsc::Receiver<ClientConn>,
    shutdown: watch::Sender<bool>,
}

impl ChannelListener {
    pub(crate) fn new(conns: mpsc::Receiver<ClientConn>, shutdown: watch::Sender<bool>) -> Self {
        Self { conns, shutdown }
    }

    /// Wait for the next connection of this classification.
    pub async fn accept(&mut self) -> Result<ClientConn, MuxError> {
        self.conns.recv().await.ok_or(MuxError::Closed)
    }

    /// Stop the accept pump. Idempotent; shared with the sibling listener.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle for re-injecting connections into classification.
///
/// Used by the CONNECT front-end: after the `200 OK` upgrade, the client's
/// follow-up bytes are classified like a fresh connection, carrying the
/// CONNECT target as their original destination.
#[derive(Clone)]
pub struct ConnInjector {
    tx: mpsc::Sender<ClientConn>,
}

impl ConnInjector {
    pub(crate) fn new(tx: mpsc::Sender<ClientConn>) -> Self {
        Self { tx }
    }

    pub async fn inject(&self, conn: ClientConn) -> Result<(), MuxError> {
        self.tx.send(conn).await.map_err(|_| MuxError::Closed)
    }
}
