//! Error types for upstream dialling and pooling.

use thiserror::Error;

/// Errors from the outbound dialer and the channel pool.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// TCP connect to the target (or the outer proxy) failed.
    #[error("failed dialing '{authority}': {source}")]
    Dial {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    /// The outer HTTP proxy refused our CONNECT.
    #[error("outer proxy refused CONNECT to '{authority}': {status}")]
    ProxyConnect { authority: String, status: String },

    /// The target hostname is not a valid TLS server name.
    #[error("invalid server name: {0}")]
    ServerName(String),

    /// TLS handshake with the upstream failed.
    #[error("upstream TLS error: {0}")]
    Tls(String),

    /// tonic transport-level failure while establishing a channel.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
