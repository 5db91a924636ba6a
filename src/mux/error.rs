//! Error types for connection classification.

use thiserror::Error;

/// Errors surfaced by the classifying listener and its middleware.
#[derive(Debug, Error)]
pub enum MuxError {
    /// I/O error while peeking or accepting.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A classified-connection channel or the listener itself was closed.
    #[error("listener closed")]
    Closed,
}
