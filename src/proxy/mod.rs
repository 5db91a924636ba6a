//! The proxy server: request routing, the recording reverse proxy, and the
//! bootstrap that wires one TCP listener through the mux into the HTTP and
//! gRPC handlers.

pub mod error;
pub mod reverse;
pub mod router;
pub mod server;
pub mod sysproxy;

use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};

use crate::mux::OriginalDst;

pub use error::ServeError;
pub use router::Router;
pub use server::{BoundProxy, ProxyConfig, ProxyServer, ProxyServerBuilder};

/// Type-erased error for response bodies of mixed provenance.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Unified response body across the gRPC and HTTP paths.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Per-connection facts the router threads through request extensions.
#[derive(Clone, Debug, Default)]
pub struct ConnContext {
    /// Whether this connection arrived TLS-terminated.
    pub tls: bool,
    /// The pre-proxy destination, when one was captured.
    pub original_dst: Option<OriginalDst>,
    pub peer: Option<SocketAddr>,
}

pub(crate) fn full_body(bytes: Bytes) -> ProxyBody {
    Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
}

pub(crate) fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}
