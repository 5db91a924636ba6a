//! Error types for certificate material handling.

use thiserror::Error;

/// Errors from CA loading, leaf minting, and acceptor construction.
#[derive(Debug, Error)]
pub enum CertError {
    /// Reading certificate material from disk failed.
    #[error("failed reading certificate material: {0}")]
    Read(#[from] std::io::Error),

    /// Key or certificate generation/signing failed.
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    /// A certificate PEM could not be parsed.
    #[error("failed to parse certificate PEM: {0}")]
    ParseCert(String),

    /// A private key PEM could not be parsed.
    #[error("failed to parse private key PEM: {0}")]
    ParseKey(String),

    /// rustls rejected the material.
    #[error("TLS error: {0}")]
    Tls(String),
}
