//! Error types for the proxy server surface.

use thiserror::Error;

/// Errors fatal to the serving loops (configuration and listener failures).
#[derive(Debug, Error)]
pub enum ServeError {
    /// Listener could not be bound.
    #[error("failed to bind '{addr}': {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration detected at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Certificate material could not be loaded.
    #[error("certificate error: {0}")]
    Cert(#[from] crate::tls::CertError),

    /// A classified listener failed.
    #[error("listener error: {0}")]
    Mux(#[from] crate::mux::MuxError),

    /// System proxy registration failed.
    #[error("system proxy error: {0}")]
    SystemProxy(String),

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SIGINT/SIGTERM requested an orderly shutdown.
    #[error("shutdown requested")]
    Shutdown,
}
