//! Splits one TCP listener into a plaintext listener and a TLS listener.
//!
//! Three classifiers run in priority order over every accepted connection:
//! a TLS record-layer sniff, an HTTP method sniff, and a transparent-redirect
//! fallback that blind-forwards connections whose original destination is
//! known. Anything that survives the whole chain lands in the plaintext path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::upstream::{server_name, split_authority, tls_client_config};

use super::classify::{
    is_tls_client_hello, starts_with_http_method, ChannelListener, ChannelSink, ConnInjector,
    Middleware, PatternClassifier,
};
use super::conn::{ClientConn, OriginalDst};
use super::error::MuxError;
use super::origdst;

/// Channel capacity for each classified stream.
const CHANNEL_CAPACITY: usize = 128;

/// Tuning knobs for [`split`].
#[derive(Clone, Debug, Default)]
pub struct SplitOptions {
    /// Optional deadline for classification peeks. `None` means each peek is
    /// a single read attempt.
    pub classify_deadline: Option<Duration>,
}

/// The two listeners produced by [`split`], plus the re-injection handle.
pub struct TlsSplit {
    /// Plaintext HTTP (and anything unclassifiable without a destination).
    pub plain: ChannelListener,
    /// TLS connections awaiting termination.
    pub tls: ChannelListener,
    /// Feed connections back into classification (CONNECT front-end).
    pub injector: ConnInjector,
}

/// Install the classifier chain over `listener`.
///
/// `intercept` says whether a certificate minter is available; without one,
/// TLS connections are blind-forwarded to their original destination instead
/// of terminated.
pub fn split(listener: TcpListener, intercept: bool, opts: SplitOptions) -> TlsSplit {
    let (plain_tx, plain_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (tls_tx, tls_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (inject_tx, mut inject_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let middlewares: Arc<Vec<Arc<dyn Middleware>>> = Arc::new(vec![
        Arc::new(PatternClassifier::new(
            vec![3],
            is_tls_client_hello,
            opts.classify_deadline,
            Arc::new(TlsRoute {
                tx: tls_tx,
                intercept,
            }),
        )),
        Arc::new(PatternClassifier::new(
            vec![4, 5, 6, 7, 8],
            starts_with_http_method,
            opts.classify_deadline,
            Arc::new(ChannelSink::new(plain_tx.clone())),
        )),
        Arc::new(TransparentFallback),
    ]);

    // Accept pump: merges fresh sockets with re-injected connections and
    // classifies each on its own task so a slow peek never stalls accepts.
    let pump_plain_tx = plain_tx;
    let pump_inject_guard = inject_tx.clone();
    tokio::spawn(async move {
        let _inject_guard = pump_inject_guard;
        loop {
            let conn = tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("mux shutting down; closing listener");
                        break;
                    }
                    continue;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => wrap_tcp(stream, peer),
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                },
                injected = inject_rx.recv() => match injected {
                    Some(conn) => conn,
                    None => continue,
                },
            };

            let middlewares = middlewares.clone();
            let plain_tx = pump_plain_tx.clone();
            tokio::spawn(async move {
                let mut current = conn;
                for middleware in middlewares.iter() {
                    match middleware.handle(current).await {
                        Ok(Some(next)) => current = next,
                        Ok(None) => return,
                        Err(e) => {
                            debug!(error = %e, "connection classification failed");
                            return;
                        }
                    }
                }
                // Chain exhausted: plaintext path.
                if plain_tx.send(current).await.is_err() {
                    debug!("plaintext channel closed; dropping connection");
                }
            });
        }
    });

    TlsSplit {
        plain: ChannelListener::new(plain_rx, shutdown_tx.clone()),
        tls: ChannelListener::new(tls_rx, shutdown_tx),
        injector: ConnInjector::new(inject_tx),
    }
}

fn wrap_tcp(stream: TcpStream, peer: std::net::SocketAddr) -> ClientConn {
    let original_dst = origdst::original_destination(&stream).map(|addr| OriginalDst {
        tls: false,
        authority: addr.to_string(),
    });
    ClientConn::new(Box::new(stream), Some(peer), original_dst)
}

/// Takes TLS connections: to the termination channel when interception is
/// possible, otherwise blind-forwarded to the recorded destination.
struct TlsRoute {
    tx: mpsc::Sender<ClientConn>,
    intercept: bool,
}

#[async_trait]
impl Middleware for TlsRoute {
    async fn handle(&self, conn: ClientConn) -> Result<Option<ClientConn>, MuxError> {
        if self.intercept {
            self.tx.send(conn).await.map_err(|_| MuxError::Closed)?;
            return Ok(None);
        }
        match conn.original_destination().cloned() {
            Some(dst) => {
                tokio::spawn(blind_forward(conn, dst));
            }
            None => {
                debug!("TLS connection with no interception and no known destination; closing");
            }
        }
        Ok(None)
    }
}

/// Blind-forwards transparently redirected connections whose protocol the
/// earlier classifiers did not recognise.
struct TransparentFallback;

#[async_trait]
impl Middleware for TransparentFallback {
    async fn handle(&self, conn: ClientConn) -> Result<Option<ClientConn>, MuxError> {
        match conn.original_destination().cloned() {
            Some(dst) => {
                tokio::spawn(blind_forward(conn, dst));
                Ok(None)
            }
            None => Ok(Some(conn)),
        }
    }
}

/// Splice bytes between `conn` and its original destination until either side
/// closes, then close both. Dials with TLS when the original leg was TLS.
async fn blind_forward(conn: ClientConn, dst: OriginalDst) {
    debug!(authority = %dst.authority, tls = dst.tls, "forwarding connection without interception");

    let upstream = match TcpStream::connect(&dst.authority).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(authority = %dst.authority, error = %e, "failed dialing original destination");
            return;
        }
    };

    if dst.tls {
        let (host, _) = split_authority(&dst.authority);
        let name = match server_name(host) {
            Ok(name) => name,
            Err(e) => {
                debug!(authority = %dst.authority, error = %e, "invalid server name for blind forward");
                return;
            }
        };
        let connector = tokio_rustls::TlsConnector::from(tls_client_config());
        match connector.connect(name, upstream).await {
            Ok(tls_stream) => splice(conn, tls_stream).await,
            Err(e) => {
                debug!(authority = %dst.authority, error = %e, "upstream TLS handshake failed");
            }
        }
    } else {
        splice(conn, upstream).await;
    }
}

async fn splice<U>(conn: ClientConn, upstream: U)
where
    U: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(conn);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut upstream_write) => {
            if let Err(e) = result {
                debug!(error = %e, "client->upstream splice ended");
            }
        }
        result = tokio::io::copy(&mut upstream_read, &mut client_write) => {
            if let Err(e) = result {
                debug!(error = %e, "upstream->client splice ended");
            }
        }
    }
}
