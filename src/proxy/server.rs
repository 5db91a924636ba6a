//! Server bootstrap: binds one TCP listener, splits it into plaintext and
//! TLS-terminated listeners, and serves both with the shared router.
//!
//! Each accepted connection is handled on its own task with a combined
//! HTTP/1.1 + HTTP/2 connection driver, so plaintext gRPC (h2c), TLS gRPC,
//! gRPC-Web, and ordinary HTTP all arrive on the same port. The first error
//! from any serving loop ends `run`; SIGINT/SIGTERM shut down cleanly after
//! unregistering the system proxy.

use std::path::PathBuf;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::har::HarRecorder;
use crate::mux::{self, ChannelListener, ClientConn, SplitOptions, TlsSplit};
use crate::relay::RpcRelay;
use crate::tls::{self, CertAuthority, LeafMinter};
use crate::upstream::{split_authority, ChannelPool, OutboundDialer};

use super::error::ServeError;
use super::router::Router;
use super::{sysproxy, ConnContext};

/// Static configuration for one proxy instance.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Interface to bind (hostname or address).
    pub interface: String,
    pub port: u16,
    /// Fallback upstream `host[:port]` when a request carries no routable
    /// destination of its own.
    pub destination: Option<String>,
    /// CA certificate (or static server certificate) PEM path.
    pub cert_path: Option<PathBuf>,
    /// Private key PEM path matching `cert_path`.
    pub key_path: Option<PathBuf>,
    /// HAR output path; in-memory capture happens regardless.
    pub har_path: Option<PathBuf>,
    /// NSS-format TLS key log path.
    pub key_log_path: Option<PathBuf>,
    /// Register as the OS system proxy while running.
    pub system_proxy: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            interface: "localhost".to_string(),
            port: 8080,
            destination: None,
            cert_path: None,
            key_path: None,
            har_path: None,
            key_log_path: None,
            system_proxy: false,
        }
    }
}

/// The intercepting proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    pub fn builder() -> ProxyServerBuilder {
        ProxyServerBuilder::new()
    }

    /// Load certificate material and bind the listener.
    pub async fn bind(self) -> Result<BoundProxy, ServeError> {
        let minter = load_minter(&self.config)?;

        let bind_addr = format!("{}:{}", self.config.interface, self.config.port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ServeError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(BoundProxy {
            config: self.config,
            minter,
            listener,
            local_addr,
        })
    }

    /// Bind, serve, and block until the first serving error or a shutdown
    /// signal.
    pub async fn run(self) -> Result<(), ServeError> {
        self.bind().await?.serve().await
    }
}

/// A proxy with its listener bound but not yet serving.
pub struct BoundProxy {
    config: ProxyConfig,
    minter: Option<Arc<LeafMinter>>,
    listener: TcpListener,
    local_addr: std::net::SocketAddr,
}

impl BoundProxy {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Serve until the first serving error or a shutdown signal.
    pub async fn serve(self) -> Result<(), ServeError> {
        let BoundProxy {
            config,
            minter,
            listener,
            local_addr,
        } = self;

        info!(addr = %local_addr, "listening");
        if minter.is_some() {
            info!("intercepting TLS connections");
        } else {
            info!("not intercepting TLS connections (no CA material)");
        }

        let TlsSplit {
            plain,
            tls,
            injector,
        } = mux::split(listener, minter.is_some(), SplitOptions::default());

        let dialer = Arc::new(OutboundDialer::from_env());
        let recorder = Arc::new(HarRecorder::new(config.har_path.clone()));
        let pool = Arc::new(ChannelPool::new(dialer.clone()));
        let relay = RpcRelay::new(pool.clone(), config.destination.clone(), Some(local_addr));
        let router = Arc::new(Router::new(relay, recorder, dialer, injector));

        let (err_tx, mut err_rx) = mpsc::channel::<ServeError>(4);

        let _system_proxy = if config.system_proxy {
            let guard = sysproxy::enable(&local_addr).map_err(ServeError::SystemProxy)?;
            info!("registered as system proxy");
            Some(guard)
        } else {
            None
        };

        spawn_signal_task(err_tx.clone());
        spawn_serve_loop(plain, router.clone(), None, err_tx.clone());

        match minter {
            Some(minter) => {
                let fallback = config
                    .destination
                    .as_deref()
                    .map(|destination| split_authority(destination).0.to_string());
                let acceptor =
                    tls::tls_acceptor(minter, fallback, config.key_log_path.as_deref())?;
                spawn_serve_loop(tls, router, Some(acceptor), err_tx);
            }
            None => {
                // The mux blind-forwards TLS instead; nothing feeds this
                // listener.
                drop(tls);
                drop(err_tx);
            }
        }

        let result = err_rx.recv().await.unwrap_or(ServeError::Shutdown);
        pool.shutdown();
        match result {
            ServeError::Shutdown => {
                info!("proxy shut down");
                Ok(())
            }
            error => Err(error),
        }
    }
}

/// Decide the interception mode from configured or probed material.
///
/// The pair is tried as a signing CA first; material that does not parse as
/// a CA is used as a static server certificate instead.
fn load_minter(config: &ProxyConfig) -> Result<Option<Arc<LeafMinter>>, ServeError> {
    let paths = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        (None, None) => tls::detect_ca_paths(),
        _ => {
            return Err(ServeError::Config(
                "either both --cert and --key or neither must be given".to_string(),
            ))
        }
    };
    let Some((cert_path, key_path)) = paths else {
        return Ok(None);
    };

    match CertAuthority::load(&cert_path, &key_path) {
        Ok(authority) => {
            info!(cert = %cert_path.display(), "loaded signing CA");
            Ok(Some(Arc::new(LeafMinter::dynamic(authority))))
        }
        Err(e) => {
            debug!(error = %e, "material is not a signing CA; trying static server certificate");
            let minter = LeafMinter::static_from_files(&cert_path, &key_path)?;
            info!(cert = %cert_path.display(), "loaded static server certificate");
            Ok(Some(Arc::new(minter)))
        }
    }
}

fn spawn_serve_loop(
    mut listener: ChannelListener,
    router: Arc<Router>,
    acceptor: Option<TlsAcceptor>,
    err_tx: mpsc::Sender<ServeError>,
) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let router = router.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(serve_conn(conn, router, acceptor));
                }
                Err(e) => {
                    let _ = err_tx.send(e.into()).await;
                    break;
                }
            }
        }
    });
}

async fn serve_conn(conn: ClientConn, router: Arc<Router>, acceptor: Option<TlsAcceptor>) {
    let ctx = ConnContext {
        tls: acceptor.is_some(),
        original_dst: conn.original_destination().cloned(),
        peer: conn.peer_addr(),
    };

    let service = service_fn(move |req| {
        let router = router.clone();
        let ctx = ctx.clone();
        async move { router.route(req, ctx).await }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let result = match acceptor {
        Some(acceptor) => match acceptor.accept(conn).await {
            Ok(stream) => {
                builder
                    .serve_connection_with_upgrades(TokioIo::new(stream), service)
                    .await
            }
            Err(e) => {
                debug!(error = %e, "TLS handshake with client failed");
                return;
            }
        },
        None => {
            builder
                .serve_connection_with_upgrades(TokioIo::new(conn), service)
                .await
        }
    };

    if let Err(e) = result {
        let text = e.to_string();
        // Resets and closes are routine for an intercepting proxy.
        if !text.contains("connection closed")
            && !text.contains("connection reset")
            && !text.contains("broken pipe")
            && !text.contains("early eof")
        {
            debug!(error = %text, "connection ended with error");
        }
    }
}

#[cfg(unix)]
fn spawn_signal_task(err_tx: mpsc::Sender<ServeError>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let (mut interrupt, mut terminate) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
                _ => {
                    warn!("failed installing signal handlers");
                    return;
                }
            };
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        info!("shutdown signal received");
        let _ = err_tx.send(ServeError::Shutdown).await;
    });
}

#[cfg(not(unix))]
fn spawn_signal_task(err_tx: mpsc::Sender<ServeError>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = err_tx.send(ServeError::Shutdown).await;
        }
    });
}

/// Builder mirroring the CLI surface.
#[derive(Default)]
pub struct ProxyServerBuilder {
    config: ProxyConfig,
}

impl ProxyServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ProxyConfig::default(),
        }
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.config.interface = interface.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn destination(mut self, destination: Option<String>) -> Self {
        self.config.destination = destination;
        self
    }

    pub fn ca_material(mut self, cert: Option<PathBuf>, key: Option<PathBuf>) -> Self {
        self.config.cert_path = cert;
        self.config.key_path = key;
        self
    }

    pub fn har_path(mut self, path: Option<PathBuf>) -> Self {
        self.config.har_path = path;
        self
    }

    pub fn key_log_path(mut self, path: Option<PathBuf>) -> Self {
        self.config.key_log_path = path;
        self
    }

    pub fn system_proxy(mut self, enabled: bool) -> Self {
        self.config.system_proxy = enabled;
        self
    }

    pub fn build(self) -> ProxyServer {
        ProxyServer::new(self.config)
    }
}
